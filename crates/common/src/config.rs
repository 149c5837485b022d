//! vmshare configuration
//!
//! Environment-derived config loaded once at startup. Unknown profile tags
//! are rejected at parse time; the profile table itself is a constant map.

use crate::types::{OsProfile, ProfileTag};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite file backing the session registry and user quota rows.
    pub database_path: PathBuf,

    /// Per-instance runtime files (display/control sockets, pidfiles).
    pub run_dir: PathBuf,

    /// Saved snapshots, canonical `{user}__{os}__{id}.qcow2` names.
    pub snapshots_dir: PathBuf,

    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub upload: UploadConfig,
    pub timeouts: TimeoutConfig,

    #[serde(skip)]
    pub profiles: ProfileTable,
}

/// Server and gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP shell bind address.
    pub listen_addr: String,

    /// Host name clients use to reach bridge ports; goes into redirect URLs.
    pub public_host: String,

    /// WebSocket gateway base URL advertised to clients.
    pub ws_gateway_base: String,

    /// Default display backend for bridges.
    pub default_backend: DisplayBackend,

    /// Fallback TCP display endpoint for `tcp` backends.
    pub tcp_host: String,
    pub tcp_port: u16,

    pub session_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            public_host: "127.0.0.1".to_string(),
            ws_gateway_base: "ws://127.0.0.1:6080/ws".to_string(),
            default_backend: DisplayBackend::Unix,
            tcp_host: "127.0.0.1".to_string(),
            tcp_port: 5901,
            session_ttl_secs: 300,
        }
    }
}

/// Which kind of display endpoint a bridge connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayBackend {
    Unix,
    Tcp,
}

impl std::str::FromStr for DisplayBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unix" => Ok(DisplayBackend::Unix),
            "tcp" => Ok(DisplayBackend::Tcp),
            other => Err(Error::InvalidConfig(format!(
                "DEFAULT_BACKEND must be unix or tcp, got {other}"
            ))),
        }
    }
}

/// Token validation settings. Token issuance is an external collaborator;
/// the shell only verifies signature and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub secret_key: String,
    pub token_algorithm: String,
    pub access_token_expire_minutes: u64,
    pub cookie_max_age_secs: u64,
}

/// Installer upload limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_installer_bytes: u64,
    pub chunk_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_installer_bytes: 5 * 1024 * 1024 * 1024,
            chunk_size: 1024 * 1024,
        }
    }
}

/// Operation deadlines, all overridable from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub pidfile_wait_secs: u64,
    pub rpc_deadline_secs: u64,
    pub backup_deadline_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pidfile_wait_secs: 10,
            rpc_deadline_secs: 4,
            backup_deadline_secs: 300,
            shutdown_grace_secs: 5,
        }
    }
}

/// Constant profile map keyed by tag.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    profiles: HashMap<ProfileTag, OsProfile>,
}

impl ProfileTable {
    /// The built-in table, rooted at the image directory.
    pub fn builtin(image_root: &Path) -> Self {
        let overlay = |tag: ProfileTag, dir: &str, prefix: &str, base: &str, mem: u32, cpus: Option<u32>| {
            OsProfile {
                tag,
                overlay_dir: Some(image_root.join("overlays").join(dir)),
                overlay_prefix: Some(prefix.to_string()),
                base_image: image_root.join("base_images").join(base),
                installer_prefix: None,
                default_memory_mb: mem,
                default_cpus: cpus,
            }
        };

        let mut profiles = HashMap::new();
        profiles.insert(
            ProfileTag::Alpine,
            overlay(ProfileTag::Alpine, "Alpine", "alpine", "Alpine/alpine-base.qcow2", 1024, None),
        );
        profiles.insert(
            ProfileTag::Tiny,
            overlay(ProfileTag::Tiny, "Tiny", "tiny", "Tiny/tinycore-base.qcow2", 1024, None),
        );
        profiles.insert(
            ProfileTag::Ubuntu,
            overlay(ProfileTag::Ubuntu, "Ubuntu", "ubuntu", "Ubuntu/ubuntu20-base.qcow2", 2048, Some(2)),
        );
        profiles.insert(
            ProfileTag::Custom,
            OsProfile {
                tag: ProfileTag::Custom,
                overlay_dir: None,
                overlay_prefix: None,
                base_image: image_root.join("custom"),
                installer_prefix: Some("{uid}.iso".to_string()),
                default_memory_mb: 2048,
                default_cpus: None,
            },
        );
        Self { profiles }
    }

    pub fn get(&self, tag: ProfileTag) -> Result<&OsProfile> {
        self.profiles
            .get(&tag)
            .ok_or_else(|| Error::UnknownProfile(tag.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProfileTag, &OsProfile)> {
        self.profiles.iter()
    }
}

impl AppConfig {
    /// Load configuration from the environment. `SECRET_KEY` and
    /// `DATABASE_URL` are required; everything else has defaults.
    pub fn from_env() -> Result<Self> {
        let database_path = database_path_from_url(&env_required("DATABASE_URL")?);
        let secret_key = env_required("SECRET_KEY")?;

        let image_root = PathBuf::from(env_or("IMAGE_ROOT", "/srv/vmshare"));
        let run_dir = PathBuf::from(env_or("RUN_DIR", "/run/vmshare"));
        let snapshots_dir = std::env::var("SNAPSHOTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| image_root.join("snapshots"));

        let server = ServerConfig {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8000"),
            public_host: env_or("SERVER_HOST", "127.0.0.1"),
            ws_gateway_base: env_or("WS_GATEWAY_BASE", "ws://127.0.0.1:6080/ws"),
            default_backend: env_or("DEFAULT_BACKEND", "unix").parse()?,
            tcp_host: env_or("TCP_HOST", "127.0.0.1"),
            tcp_port: env_parse("TCP_PORT", 5901)?,
            session_ttl_secs: env_parse("SESSION_TTL", 300)?,
        };

        let auth = AuthConfig {
            secret_key,
            token_algorithm: env_or("TOKEN_ALGORITHM", "HS256"),
            access_token_expire_minutes: env_parse("ACCESS_TOKEN_EXPIRE_MINUTES", 30)?,
            cookie_max_age_secs: env_parse("COOKIE_MAX_AGE", 604_800)?,
        };

        let upload = UploadConfig {
            max_installer_bytes: env_parse("MAX_INSTALLER_BYTES", 5 * 1024 * 1024 * 1024)?,
            chunk_size: env_parse("CHUNK_SIZE", 1024 * 1024)?,
        };

        let timeouts = TimeoutConfig {
            pidfile_wait_secs: env_parse("PIDFILE_WAIT_SECS", 10)?,
            rpc_deadline_secs: env_parse("RPC_DEADLINE_SECS", 4)?,
            backup_deadline_secs: env_parse("BACKUP_DEADLINE_SECS", 300)?,
            shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", 5)?,
        };

        Ok(Self {
            database_path,
            run_dir,
            snapshots_dir,
            server,
            auth,
            upload,
            timeouts,
            profiles: ProfileTable::builtin(&image_root),
        })
    }

    /// A config with every path rooted under `root`. Used by tests and
    /// single-directory dev setups.
    pub fn rooted_at(root: &Path, secret_key: &str) -> Self {
        Self {
            database_path: root.join("state.db"),
            run_dir: root.join("run"),
            snapshots_dir: root.join("snapshots"),
            server: ServerConfig::default(),
            auth: AuthConfig {
                secret_key: secret_key.to_string(),
                token_algorithm: "HS256".to_string(),
                access_token_expire_minutes: 30,
                cookie_max_age_secs: 604_800,
            },
            upload: UploadConfig::default(),
            timeouts: TimeoutConfig::default(),
            profiles: ProfileTable::builtin(root),
        }
    }

}

/// Accept both a bare path and a `sqlite://` URL.
fn database_path_from_url(url: &str) -> PathBuf {
    let trimmed = url.strip_prefix("sqlite://").unwrap_or(url);
    PathBuf::from(trimmed)
}

fn env_required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::InvalidConfig(format!("{name} is required but missing"))),
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{name} has an invalid value: {v}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_config_places_everything_under_root() {
        let cfg = AppConfig::rooted_at(Path::new("/tmp/vmshare-test"), "k");
        assert_eq!(cfg.run_dir, PathBuf::from("/tmp/vmshare-test/run"));
        assert_eq!(cfg.snapshots_dir, PathBuf::from("/tmp/vmshare-test/snapshots"));
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/vmshare-test/state.db"));
    }

    #[test]
    fn builtin_profiles_cover_all_tags() {
        let table = ProfileTable::builtin(Path::new("/srv/vmshare"));
        for tag in ProfileTag::all() {
            assert!(table.get(*tag).is_ok(), "missing profile for {tag}");
        }
        assert!(table.get(ProfileTag::Custom).unwrap().is_installer_only());
        assert!(!table.get(ProfileTag::Alpine).unwrap().is_installer_only());
    }

    #[test]
    fn database_url_forms() {
        assert_eq!(
            database_path_from_url("sqlite:///var/lib/vmshare/state.db"),
            PathBuf::from("/var/lib/vmshare/state.db")
        );
        assert_eq!(
            database_path_from_url("/var/lib/vmshare/state.db"),
            PathBuf::from("/var/lib/vmshare/state.db")
        );
    }
}
