//! QEMU process supervision
//!
//! Spawns daemonized, headless QEMU instances with per-instance VNC and QMP
//! UNIX sockets, and confirms liveness through the pidfile. Stale sockets
//! and pidfiles are unconditionally unlinked before every spawn; that is a
//! contract, not a heuristic.

use crate::ports::InstancePaths;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vmshare_common::config::TimeoutConfig;
use vmshare_common::types::{utc_now_iso, InstanceMeta, OsProfile};
use vmshare_common::{Error, Result};

const PIDFILE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Extra disks attached to an installer boot.
#[derive(Debug, Clone, Default)]
pub struct InstallerDisks {
    /// Scratch qcow2 created on demand for the install session.
    pub scratch: Option<PathBuf>,
    /// Explicit install-target disk.
    pub install_target: Option<PathBuf>,
}

/// QEMU launcher for the three boot modes.
#[derive(Clone)]
pub struct Supervisor {
    run_dir: PathBuf,
    timeouts: TimeoutConfig,
    binary: String,
}

impl Supervisor {
    pub fn new(run_dir: PathBuf, timeouts: TimeoutConfig) -> Self {
        Self {
            run_dir,
            timeouts,
            binary: std::env::var("QEMU_BIN").unwrap_or_else(|_| "qemu-system-x86_64".to_string()),
        }
    }

    /// Boot from a qcow2 overlay: virtio disk, writeback cache, discard,
    /// user-mode virtio network.
    pub async fn boot_overlay(
        &self,
        user_id: &str,
        instance_id: &str,
        profile: &OsProfile,
        overlay: &Path,
        memory_mb: Option<u32>,
    ) -> Result<InstanceMeta> {
        if !overlay.exists() {
            return Err(Error::ImageMissing(overlay.to_path_buf()));
        }

        let paths = self.prepare_paths(instance_id).await?;
        let args = disk_boot_args(overlay, profile, memory_mb);
        self.spawn_and_wait(user_id, instance_id, overlay, args, &paths)
            .await
    }

    /// Boot the user's installer image as a read-only CDROM with BIOS
    /// firmware and TCG acceleration for portability.
    pub async fn boot_installer(
        &self,
        user_id: &str,
        instance_id: &str,
        profile: &OsProfile,
        installer: &Path,
        disks: &InstallerDisks,
        memory_mb: Option<u32>,
    ) -> Result<InstanceMeta> {
        if !installer.exists() {
            return Err(Error::ImageMissing(installer.to_path_buf()));
        }

        let paths = self.prepare_paths(instance_id).await?;
        let args = installer_boot_args(installer, profile, disks, memory_mb);
        self.spawn_and_wait(user_id, instance_id, installer, args, &paths)
            .await
    }

    /// Boot from a saved snapshot file. Same shape as an overlay boot with
    /// the snapshot as the drive.
    pub async fn boot_snapshot(
        &self,
        user_id: &str,
        instance_id: &str,
        profile: &OsProfile,
        snapshot: &Path,
        memory_mb: Option<u32>,
    ) -> Result<InstanceMeta> {
        if !snapshot.exists() {
            return Err(Error::ImageMissing(snapshot.to_path_buf()));
        }

        let paths = self.prepare_paths(instance_id).await?;
        let args = disk_boot_args(snapshot, profile, memory_mb);
        self.spawn_and_wait(user_id, instance_id, snapshot, args, &paths)
            .await
    }

    /// Unlink stale per-instance files and make sure the run dir exists.
    async fn prepare_paths(&self, instance_id: &str) -> Result<InstancePaths> {
        tokio::fs::create_dir_all(&self.run_dir).await?;
        let paths = InstancePaths::for_instance(&self.run_dir, instance_id);
        for (path, err) in paths.unlink_all() {
            warn!("Failed to unlink stale {}: {}", path.display(), err);
        }
        Ok(paths)
    }

    async fn spawn_and_wait(
        &self,
        user_id: &str,
        instance_id: &str,
        image: &Path,
        mode_args: Vec<String>,
        paths: &InstancePaths,
    ) -> Result<InstanceMeta> {
        let mut args = mode_args;
        args.extend([
            "-vnc".to_string(),
            format!("unix:{}", paths.vnc_socket.display()),
            "-qmp".to_string(),
            format!("unix:{},server,nowait", paths.qmp_socket.display()),
            "-display".to_string(),
            "none".to_string(),
            "-daemonize".to_string(),
            "-pidfile".to_string(),
            paths.pidfile.display().to_string(),
        ]);

        debug!("QEMU command: {} {}", self.binary, args.join(" "));
        info!("Launching QEMU for user {} (instance {})", user_id, instance_id);

        let output = Command::new(&self.binary).args(&args).output().await?;
        if !output.status.success() {
            return Err(Error::LaunchFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let pid = self.wait_for_pidfile(&paths.pidfile).await?;
        info!("QEMU started for instance {} with pid {}", instance_id, pid);

        Ok(InstanceMeta {
            user_id: user_id.to_string(),
            instance_id: instance_id.to_string(),
            image_path: image.to_path_buf(),
            vnc_socket: paths.vnc_socket.clone(),
            qmp_socket: paths.qmp_socket.clone(),
            pidfile: paths.pidfile.clone(),
            pid,
            started_at: utc_now_iso(),
        })
    }

    /// Poll for the daemonized child's pidfile.
    async fn wait_for_pidfile(&self, pidfile: &Path) -> Result<u32> {
        let deadline = Duration::from_secs(self.timeouts.pidfile_wait_secs);
        let started = tokio::time::Instant::now();

        loop {
            if let Ok(contents) = tokio::fs::read_to_string(pidfile).await {
                if let Ok(pid) = contents.trim().parse::<u32>() {
                    return Ok(pid);
                }
            }
            if started.elapsed() >= deadline {
                return Err(Error::PidfileMissing {
                    path: pidfile.to_path_buf(),
                    seconds: self.timeouts.pidfile_wait_secs,
                });
            }
            tokio::time::sleep(PIDFILE_POLL_INTERVAL).await;
        }
    }
}

/// Mode args for overlay and snapshot boots: the disk image on virtio with
/// writeback cache and discard, user-mode virtio network.
fn disk_boot_args(image: &Path, profile: &OsProfile, memory_mb: Option<u32>) -> Vec<String> {
    let mem = memory_mb.unwrap_or(profile.default_memory_mb);
    let mut args = vec![
        "-m".to_string(),
        mem.to_string(),
        "-drive".to_string(),
        format!(
            "file={},format=qcow2,if=virtio,cache=writeback,discard=unmap",
            image.display()
        ),
        "-nic".to_string(),
        "user,model=virtio-net-pci".to_string(),
    ];
    if let Some(cpus) = profile.default_cpus {
        args.extend(["-smp".to_string(), cpus.to_string()]);
    }
    args
}

/// Mode args for installer boots: read-only CDROM, boot from it, BIOS
/// firmware with TCG acceleration, plus the optional target and scratch
/// disks.
fn installer_boot_args(
    installer: &Path,
    profile: &OsProfile,
    disks: &InstallerDisks,
    memory_mb: Option<u32>,
) -> Vec<String> {
    let mem = memory_mb.unwrap_or(profile.default_memory_mb);
    let mut args = vec![
        "-accel".to_string(),
        "tcg".to_string(),
        "-m".to_string(),
        mem.to_string(),
        "-drive".to_string(),
        format!("file={},media=cdrom,readonly=on", installer.display()),
        "-boot".to_string(),
        "d".to_string(),
        "-nic".to_string(),
        "user,model=virtio-net-pci".to_string(),
    ];
    for disk in [&disks.install_target, &disks.scratch].into_iter().flatten() {
        args.extend([
            "-drive".to_string(),
            format!("file={},format=qcow2,if=virtio", disk.display()),
        ]);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(run_dir: &Path) -> Supervisor {
        Supervisor::new(
            run_dir.to_path_buf(),
            TimeoutConfig {
                pidfile_wait_secs: 1,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn pidfile_wait_reads_pid_once_written() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let pidfile = dir.path().join("qemu-abc.pid");

        let writer = {
            let pidfile = pidfile.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                tokio::fs::write(&pidfile, "4321\n").await.unwrap();
            })
        };

        let pid = sup.wait_for_pidfile(&pidfile).await.unwrap();
        assert_eq!(pid, 4321);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn pidfile_timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let err = sup
            .wait_for_pidfile(&dir.path().join("qemu-never.pid"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PidfileMissing { seconds: 1, .. }));
    }

    #[tokio::test]
    async fn overlay_boot_requires_the_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let profile = OsProfile {
            tag: vmshare_common::types::ProfileTag::Alpine,
            overlay_dir: Some(dir.path().to_path_buf()),
            overlay_prefix: Some("alpine".to_string()),
            base_image: dir.path().join("alpine-base.qcow2"),
            installer_prefix: None,
            default_memory_mb: 512,
            default_cpus: None,
        };

        let err = sup
            .boot_overlay("u1", "abc123", &profile, &dir.path().join("missing.qcow2"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageMissing(_)));
    }

    fn profile(cpus: Option<u32>) -> OsProfile {
        OsProfile {
            tag: vmshare_common::types::ProfileTag::Ubuntu,
            overlay_dir: Some(PathBuf::from("/var/ov")),
            overlay_prefix: Some("ubuntu".to_string()),
            base_image: PathBuf::from("/srv/base/ubuntu20-base.qcow2"),
            installer_prefix: None,
            default_memory_mb: 2048,
            default_cpus: cpus,
        }
    }

    #[test]
    fn disk_boot_flags() {
        let args = disk_boot_args(Path::new("/var/ov/ubuntu_ab.qcow2"), &profile(Some(2)), None);
        let joined = args.join(" ");
        assert!(joined.contains("-m 2048"));
        assert!(joined.contains(
            "file=/var/ov/ubuntu_ab.qcow2,format=qcow2,if=virtio,cache=writeback,discard=unmap"
        ));
        assert!(joined.contains("user,model=virtio-net-pci"));
        assert!(joined.contains("-smp 2"));

        // Memory override wins over the profile default.
        let args = disk_boot_args(Path::new("/var/ov/ubuntu_ab.qcow2"), &profile(None), Some(512));
        assert!(args.join(" ").contains("-m 512"));
        assert!(!args.join(" ").contains("-smp"));
    }

    #[test]
    fn installer_boot_flags() {
        let disks = InstallerDisks {
            scratch: Some(PathBuf::from("/srv/custom/u1_ab_scratch.qcow2")),
            install_target: Some(PathBuf::from("/srv/custom/u1_target.qcow2")),
        };
        let args = installer_boot_args(Path::new("/srv/custom/u1.iso"), &profile(None), &disks, None);
        let joined = args.join(" ");
        assert!(joined.contains("-accel tcg"));
        assert!(joined.contains("file=/srv/custom/u1.iso,media=cdrom,readonly=on"));
        assert!(joined.contains("-boot d"));
        // The install target comes before the scratch disk.
        let target_at = joined.find("u1_target").unwrap();
        let scratch_at = joined.find("u1_ab_scratch").unwrap();
        assert!(target_at < scratch_at);

        let bare = installer_boot_args(
            Path::new("/srv/custom/u1.iso"),
            &profile(None),
            &InstallerDisks::default(),
            None,
        );
        assert!(!bare.join(" ").contains("u1_target"));
    }

    #[tokio::test]
    async fn prepare_paths_unlinks_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let paths = InstancePaths::for_instance(dir.path(), "stale0");
        std::fs::write(&paths.vnc_socket, b"").unwrap();
        std::fs::write(&paths.pidfile, b"1").unwrap();

        let prepared = sup.prepare_paths("stale0").await.unwrap();
        assert_eq!(prepared, paths);
        assert!(!paths.vnc_socket.exists());
        assert!(!paths.pidfile.exists());
    }
}
