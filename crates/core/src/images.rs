//! Disk image management
//!
//! Copy-on-write overlays over golden base images, installer image
//! resolution and validation, snapshot file lookup, scratch disks, and
//! qcow2 size introspection via the image toolchain.

use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use vmshare_common::types::{confined_to, snapshot_file_name, OsProfile};
use vmshare_common::{Error, ProfileTable, Result};

/// Installer images smaller than this cannot hold a bootable system.
const MIN_INSTALLER_BYTES: u64 = 1024 * 1024;

/// Volume descriptors live in the sector starting at 0x8000; one of these
/// markers must appear in the first 8 KiB of that region (ISO9660 / UDF).
const VOLUME_DESCRIPTOR_OFFSET: u64 = 0x8000;
const VOLUME_DESCRIPTOR_WINDOW: usize = 8192;
const VOLUME_MARKERS: [&[u8]; 3] = [b"CD001", b"NSR02", b"NSR03"];

/// Image manager for overlays, installers and snapshot files.
#[derive(Clone)]
pub struct ImageManager {
    profiles: ProfileTable,
    snapshots_dir: PathBuf,
}

impl ImageManager {
    pub fn new(profiles: ProfileTable, snapshots_dir: PathBuf) -> Self {
        Self {
            profiles,
            snapshots_dir,
        }
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    /// Ensure the instance's qcow2 overlay exists, creating it over the
    /// profile's base image if needed. Returns the existing file untouched
    /// when it is already there.
    pub async fn create_overlay(&self, profile: &OsProfile, instance_id: &str) -> Result<PathBuf> {
        let overlay = profile.overlay_path(instance_id)?;
        if overlay.exists() {
            info!("Overlay already exists: {}", overlay.display());
            return Ok(overlay);
        }

        if let Some(parent) = overlay.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = Command::new("qemu-img")
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(&profile.base_image)
            .arg(&overlay)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::LaunchFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        info!("Created overlay {} over {}", overlay.display(), profile.base_image.display());
        Ok(overlay)
    }

    /// Resolve the installer image path for a user of this profile.
    ///
    /// The profile's base path is either a template containing `{uid}`, a
    /// fixed `.iso` file, or a directory into which per-user images are
    /// stored as `{prefix-with-uid}.iso`.
    pub fn installer_destination(&self, profile: &OsProfile, user_id: &str) -> PathBuf {
        let base = profile.base_image.to_string_lossy();
        let mut path = if base.contains("{uid}") {
            PathBuf::from(base.replace("{uid}", user_id))
        } else if profile
            .base_image
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("iso"))
        {
            profile.base_image.clone()
        } else {
            let template = profile.installer_prefix.as_deref().unwrap_or("{uid}.iso");
            profile.base_image.join(template.replace("{uid}", user_id))
        };

        // The suffix is enforced even against a misconfigured template.
        if !path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("iso"))
        {
            path.set_extension("iso");
        }
        path
    }

    /// Resolve and sanity-check an uploaded installer image.
    pub async fn resolve_installer_image(
        &self,
        profile: &OsProfile,
        user_id: &str,
    ) -> Result<PathBuf> {
        let path = self.installer_destination(profile, user_id);

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => {
                return Err(Error::ImageNotFound(format!(
                    "no installer image at {}",
                    path.display()
                )))
            }
        };
        if meta.is_dir() {
            return Err(Error::ImageNotFound(format!(
                "{} is a directory, expected an image file",
                path.display()
            )));
        }
        if meta.len() < MIN_INSTALLER_BYTES {
            return Err(Error::ImageNotFound(format!(
                "ISO too small: {} bytes",
                meta.len()
            )));
        }
        Ok(path)
    }

    /// Require an ISO9660 or UDF volume descriptor in the standard location.
    pub async fn validate_installer_image(&self, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut window = vec![0u8; VOLUME_DESCRIPTOR_WINDOW];

        if file
            .seek(std::io::SeekFrom::Start(VOLUME_DESCRIPTOR_OFFSET))
            .await
            .is_err()
        {
            return Err(Error::NotABootableImage(path.display().to_string()));
        }
        let mut read = 0;
        while read < window.len() {
            let n = file.read(&mut window[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        window.truncate(read);

        let marked = VOLUME_MARKERS
            .iter()
            .any(|marker| window.windows(marker.len()).any(|w| &w == marker));
        if !marked {
            return Err(Error::NotABootableImage(path.display().to_string()));
        }
        debug!("Installer image validated: {}", path.display());
        Ok(())
    }

    /// Resolve a snapshot by basename or absolute path, confined to the
    /// snapshots directory.
    pub fn resolve_snapshot(&self, user_id: &str, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(Error::InvalidInput("snapshot name is empty".to_string()));
        }

        let candidate = Path::new(name);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            let mut name = name.to_string();
            if !name.ends_with(".qcow2") {
                name.push_str(".qcow2");
            }
            self.snapshots_dir.join(name)
        };

        if !confined_to(&self.snapshots_dir, &path) {
            return Err(Error::InvalidInput(format!(
                "snapshot path escapes the snapshots directory: {}",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(Error::SnapshotNotFound(format!(
                "{} for user {}",
                path.display(),
                user_id
            )));
        }
        Ok(path)
    }

    /// Expected snapshot path for an instance, whether or not it exists.
    pub fn snapshot_path_for(&self, user_id: &str, os_profile: &str, instance_id: &str) -> PathBuf {
        self.snapshots_dir
            .join(snapshot_file_name(user_id, os_profile, instance_id))
    }

    /// Create an empty qcow2 scratch disk for installer boots.
    pub async fn create_scratch_disk(
        &self,
        profile: &OsProfile,
        user_id: &str,
        instance_id: &str,
        size_gb: u32,
    ) -> Result<PathBuf> {
        let dir = self.installer_dir(profile);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}_{}_scratch.qcow2", user_id, instance_id));

        let output = Command::new("qemu-img")
            .args(["create", "-f", "qcow2"])
            .arg(&path)
            .arg(format!("{}G", size_gb))
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::LaunchFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        info!("Created {} GiB scratch disk at {}", size_gb, path.display());
        Ok(path)
    }

    /// Expected scratch disk path for an instance (used by reclaim).
    pub fn scratch_disk_path(&self, profile: &OsProfile, user_id: &str, instance_id: &str) -> PathBuf {
        self.installer_dir(profile)
            .join(format!("{}_{}_scratch.qcow2", user_id, instance_id))
    }

    /// Resolve a named pre-provisioned install-target disk for an installer
    /// boot. Targets are user-namespaced qcow2 files in the installer
    /// directory and must already exist; unlike the scratch disk they
    /// survive reclaim.
    pub fn resolve_install_target(
        &self,
        profile: &OsProfile,
        user_id: &str,
        name: &str,
    ) -> Result<PathBuf> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::InvalidInput(format!(
                "not an install target name: {name:?}"
            )));
        }
        let mut file_name = format!("{}_{}", user_id, name);
        if !file_name.ends_with(".qcow2") {
            file_name.push_str(".qcow2");
        }

        let dir = self.installer_dir(profile);
        let path = dir.join(&file_name);
        if !confined_to(&dir, &path) {
            return Err(Error::InvalidInput(format!(
                "install target escapes the installer directory: {name}"
            )));
        }
        if !path.is_file() {
            return Err(Error::ImageNotFound(format!(
                "no install target disk at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// The directory installer-boot disks live in: the custom profile's
    /// directory, or the parent of its fixed image path.
    fn installer_dir(&self, profile: &OsProfile) -> PathBuf {
        if profile.base_image.extension().is_none() {
            profile.base_image.clone()
        } else {
            profile
                .base_image
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.snapshots_dir.clone())
        }
    }
}

/// On-disk size of an image in bytes, preferring the toolchain's
/// `actual-size` report over the filesystem's.
pub async fn actual_size_bytes(path: &Path) -> Result<u64> {
    let output = Command::new("qemu-img")
        .args(["info", "--output=json"])
        .arg(path)
        .output()
        .await;

    if let Ok(output) = output {
        if output.status.success() {
            if let Ok(info) = serde_json::from_slice::<serde_json::Value>(&output.stdout) {
                if let Some(size) = info.get("actual-size").and_then(|v| v.as_u64()) {
                    return Ok(size);
                }
            }
        } else {
            warn!(
                "qemu-img info failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    Ok(tokio::fs::metadata(path).await?.len())
}

/// Bytes rounded up to whole MiB, the quota billing unit.
pub fn ceil_mb(bytes: u64) -> u64 {
    bytes.div_ceil(1024 * 1024)
}
