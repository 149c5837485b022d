//! Core types for vmshare

use crate::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Tag identifying an OS profile. `Custom` is reserved for user-uploaded
/// installer images and never boots from an overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileTag {
    Alpine,
    Tiny,
    Ubuntu,
    Custom,
}

impl ProfileTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileTag::Alpine => "alpine",
            ProfileTag::Tiny => "tiny",
            ProfileTag::Ubuntu => "ubuntu",
            ProfileTag::Custom => "custom",
        }
    }

    pub fn all() -> &'static [ProfileTag] {
        &[
            ProfileTag::Alpine,
            ProfileTag::Tiny,
            ProfileTag::Ubuntu,
            ProfileTag::Custom,
        ]
    }
}

impl fmt::Display for ProfileTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alpine" => Ok(ProfileTag::Alpine),
            "tiny" => Ok(ProfileTag::Tiny),
            "ubuntu" => Ok(ProfileTag::Ubuntu),
            "custom" => Ok(ProfileTag::Custom),
            other => Err(Error::UnknownProfile(other.to_string())),
        }
    }
}

/// Static OS profile record. Overlay profiles carry `overlay_dir`,
/// `overlay_prefix` and a qcow2 base image; the `custom` profile instead
/// carries an installer destination (a `{uid}` path template, a fixed `.iso`
/// path, or a directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsProfile {
    pub tag: ProfileTag,
    pub overlay_dir: Option<PathBuf>,
    pub overlay_prefix: Option<String>,
    pub base_image: PathBuf,
    /// Installer file-name template for directory-style `custom` destinations,
    /// e.g. `{uid}.iso`.
    #[serde(default)]
    pub installer_prefix: Option<String>,
    pub default_memory_mb: u32,
    #[serde(default)]
    pub default_cpus: Option<u32>,
}

impl OsProfile {
    /// An installer-only profile has no overlay fields.
    pub fn is_installer_only(&self) -> bool {
        self.overlay_dir.is_none() || self.overlay_prefix.is_none()
    }

    /// Deterministic overlay path for an instance of this profile.
    pub fn overlay_path(&self, instance_id: &str) -> Result<PathBuf> {
        match (&self.overlay_dir, &self.overlay_prefix) {
            (Some(dir), Some(prefix)) => {
                Ok(dir.join(format!("{}_{}.qcow2", prefix, instance_id)))
            }
            _ => Err(Error::ProfileIsInstallerOnly(self.tag.to_string())),
        }
    }
}

/// What a launch request boots from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LaunchKind {
    /// Copy-on-write overlay over the profile's golden base image.
    Profile,
    /// The user's uploaded installer image, optionally with a scratch disk
    /// created on demand and/or a named pre-provisioned install-target
    /// disk.
    Installer {
        data_disk_gb: Option<u32>,
        install_target: Option<String>,
    },
    /// A previously saved disk snapshot.
    Snapshot { name: String },
}

/// A launch request as the coordinator receives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub profile: ProfileTag,
    #[serde(flatten)]
    pub kind: LaunchKind,
}

/// Hypervisor boot result: sockets, pid and start time for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub user_id: String,
    pub instance_id: String,
    pub image_path: PathBuf,
    pub vnc_socket: PathBuf,
    pub qmp_socket: PathBuf,
    pub pidfile: PathBuf,
    pub pid: u32,
    /// UTC ISO-8601 with `Z` suffix.
    pub started_at: String,
}

/// The registry's view of an instance. Every field is stored as a string
/// column; the typed accessors live here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub instance_id: String,
    pub user_id: String,
    pub os_profile: ProfileTag,
    pub image_path: String,
    pub qmp_socket: String,
    pub vnc_socket: String,
    pub pid: u32,
    pub bridge_port: u16,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub last_seen: i64,
    pub state: String,
    pub started_at: String,
}

/// Partial update to a session record. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub pid: Option<u32>,
    pub last_seen: Option<i64>,
    pub state: Option<String>,
    pub image_path: Option<String>,
}

/// Client-facing projection of a running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub user_id: String,
    pub os_profile: ProfileTag,
    pub display_socket_path: String,
    pub control_socket_path: String,
    pub bridge_port: u16,
    pub pid: u32,
    pub started_at: String,
    pub redirect_url: String,
}

impl InstanceView {
    /// Build the view from a registry record and the configured public host.
    pub fn from_record(record: &SessionRecord, public_host: &str) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            user_id: record.user_id.clone(),
            os_profile: record.os_profile,
            display_socket_path: record.vnc_socket.clone(),
            control_socket_path: record.qmp_socket.clone(),
            bridge_port: record.bridge_port,
            pid: record.pid,
            started_at: record.started_at.clone(),
            redirect_url: redirect_url(public_host, record.bridge_port),
        }
    }
}

/// Console redirect URL for a bridge port.
pub fn redirect_url(public_host: &str, bridge_port: u16) -> String {
    format!(
        "http://{host}:{port}/vnc.html?host={host}&port={port}",
        host = public_host,
        port = bridge_port
    )
}

/// One saved snapshot as reported to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub os_profile: String,
    pub instance_id: String,
    pub size_mb: u64,
    /// UTC ISO-8601 with `Z` suffix.
    pub modified_at: String,
}

/// Canonical snapshot file name: `{user}__{os}__{id}.qcow2`.
pub fn snapshot_file_name(user_id: &str, os_profile: &str, instance_id: &str) -> String {
    format!("{}__{}__{}.qcow2", user_id, os_profile, instance_id)
}

/// Parse a canonical snapshot file name back into its triplet.
pub fn parse_snapshot_file_name(name: &str) -> Option<(String, String, String)> {
    let stem = name.strip_suffix(".qcow2")?;
    let mut parts = stem.splitn(3, "__");
    let user = parts.next()?;
    let os = parts.next()?;
    let id = parts.next()?;
    if user.is_empty() || os.is_empty() || id.is_empty() {
        return None;
    }
    Some((user.to_string(), os.to_string(), id.to_string()))
}

/// Generate a fresh instance id: 12 hex chars from the OS entropy source.
pub fn new_instance_id() -> String {
    let mut bytes = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current UTC time as ISO-8601 with a `Z` suffix.
pub fn utc_now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Epoch seconds rendered as UTC ISO-8601 with a `Z` suffix.
pub fn epoch_secs_to_iso(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// True when `candidate` resolves inside `dir` without any traversal.
pub fn confined_to(dir: &Path, candidate: &Path) -> bool {
    use std::path::Component;
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return false;
    }
    candidate.starts_with(dir)
}
