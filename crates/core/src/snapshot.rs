//! Live disk snapshots and quota accounting
//!
//! Orchestrates drive-backup jobs over the instance's control socket and
//! keeps the user's stored-MB counter inside capacity as a transactional
//! post-condition of every create and remove.

use crate::images::{actual_size_bytes, ceil_mb};
use crate::ports::InstancePaths;
use crate::registry::SessionStore;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vmshare_common::config::TimeoutConfig;
use vmshare_common::qmp::{job_still_running, pick_backup_device, QmpClient};
use vmshare_common::types::{
    confined_to, epoch_secs_to_iso, parse_snapshot_file_name, snapshot_file_name, ProfileTag,
    SnapshotInfo,
};
use vmshare_common::{Error, ProfileTable, Result, UserStore};

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of a successful snapshot create.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub name: String,
    pub path: PathBuf,
    pub size_mb: u64,
}

/// Result of a snapshot remove.
#[derive(Debug, Clone)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub freed_mb: u64,
    pub total_mb: u64,
}

/// Which snapshot a remove request names.
#[derive(Debug, Clone)]
pub enum RemoveTarget {
    Name(String),
    Instance {
        os_profile: ProfileTag,
        instance_id: String,
    },
}

/// Snapshot engine over one control socket per instance.
#[derive(Clone)]
pub struct SnapshotEngine {
    run_dir: PathBuf,
    snapshots_dir: PathBuf,
    timeouts: TimeoutConfig,
    profiles: ProfileTable,
    registry: SessionStore,
    users: UserStore,
}

impl SnapshotEngine {
    pub fn new(
        run_dir: PathBuf,
        snapshots_dir: PathBuf,
        timeouts: TimeoutConfig,
        profiles: ProfileTable,
        registry: SessionStore,
        users: UserStore,
    ) -> Self {
        Self {
            run_dir,
            snapshots_dir,
            timeouts,
            profiles,
            registry,
            users,
        }
    }

    /// Take a live disk snapshot of a running instance.
    pub async fn create_snapshot(
        &self,
        user_id: &str,
        instance_id: &str,
        os_profile: ProfileTag,
    ) -> Result<SnapshotOutcome> {
        let paths = InstancePaths::for_instance(&self.run_dir, instance_id);
        if !paths.qmp_socket.exists() {
            return Err(Error::VmNotRunning(instance_id.to_string()));
        }

        let source = self
            .billing_source(user_id, instance_id, os_profile)?
            .ok_or_else(|| {
                Error::ImageMissing(self.snapshot_path(user_id, os_profile, instance_id))
            })?;

        // Bill against what the running image occupies right now; the
        // backup target will not be larger than its source.
        let bill_mb = ceil_mb(actual_size_bytes(&source).await?);
        let quota = self.users.quota(user_id)?;
        if quota.stored_mb + bill_mb > quota.capacity_mb {
            return Err(Error::QuotaExceeded {
                requested_mb: bill_mb,
                stored_mb: quota.stored_mb,
                capacity_mb: quota.capacity_mb,
            });
        }

        let name = snapshot_file_name(user_id, os_profile.as_str(), instance_id);
        let target = self.snapshots_dir.join(&name);
        tokio::fs::create_dir_all(&self.snapshots_dir).await?;

        let client = QmpClient::new(
            &paths.qmp_socket,
            Duration::from_secs(self.timeouts.rpc_deadline_secs),
        );
        let devices = client.query_block().await?;
        let device = pick_backup_device(&devices)?;
        let job_id = format!("backup-{}", instance_id);

        info!(
            "Starting drive-backup of {} ({}) to {}",
            instance_id,
            device,
            target.display()
        );
        client.drive_backup(&device, &job_id, &target).await?;

        if let Err(e) = self.wait_for_job(&client, &job_id).await {
            self.discard_file(&target).await;
            return Err(e);
        }

        let backed_up = tokio::fs::metadata(&target).await;
        if !backed_up.map(|m| m.is_file() && m.len() > 0).unwrap_or(false) {
            self.discard_file(&target).await;
            return Err(Error::Qmp(format!(
                "backup job produced no output at {}",
                target.display()
            )));
        }

        // Commit the bill; a concurrent create may have consumed the
        // remaining capacity, in which case the file is discarded and the
        // counters stay untouched.
        match self.users.add_stored(user_id, bill_mb) {
            Ok(total) => {
                info!(
                    "Snapshot {} stored ({} MB, user {} now at {} MB)",
                    name, bill_mb, user_id, total
                );
                Ok(SnapshotOutcome {
                    name,
                    path: target,
                    size_mb: bill_mb,
                })
            }
            Err(e) => {
                self.discard_file(&target).await;
                Err(e)
            }
        }
    }

    /// Delete a snapshot and release its quota, flooring at zero.
    pub async fn remove_snapshot(
        &self,
        user_id: &str,
        target: RemoveTarget,
    ) -> Result<RemoveOutcome> {
        let name = match target {
            RemoveTarget::Name(name) => {
                let mut name = name;
                if !name.ends_with(".qcow2") {
                    name.push_str(".qcow2");
                }
                let (owner, _, _) = parse_snapshot_file_name(&name).ok_or_else(|| {
                    Error::InvalidInput(format!("not a snapshot name: {name}"))
                })?;
                if owner != user_id {
                    return Err(Error::InvalidInput(format!(
                        "snapshot {name} does not belong to user {user_id}"
                    )));
                }
                name
            }
            RemoveTarget::Instance {
                os_profile,
                instance_id,
            } => snapshot_file_name(user_id, os_profile.as_str(), &instance_id),
        };

        let path = self.snapshots_dir.join(&name);
        if !confined_to(&self.snapshots_dir, &path) {
            return Err(Error::InvalidInput(format!(
                "snapshot name escapes the snapshots directory: {name}"
            )));
        }

        let Ok(meta) = tokio::fs::metadata(&path).await else {
            debug!("Snapshot {} already absent", path.display());
            return Ok(RemoveOutcome {
                removed: false,
                freed_mb: 0,
                total_mb: self.users.quota(user_id)?.stored_mb,
            });
        };

        let freed_mb = ceil_mb(actual_size_bytes(&path).await.unwrap_or(meta.len()));
        tokio::fs::remove_file(&path).await?;
        let total_mb = self.users.release_stored(user_id, freed_mb)?;
        info!(
            "Removed snapshot {} ({} MB freed, user {} now at {} MB)",
            name, freed_mb, user_id, total_mb
        );

        Ok(RemoveOutcome {
            removed: true,
            freed_mb,
            total_mb,
        })
    }

    /// All snapshots belonging to a user, by canonical name.
    pub async fn list_user_snapshots(&self, user_id: &str) -> Result<Vec<SnapshotInfo>> {
        let prefix = format!("{}__", user_id);
        let mut out = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.snapshots_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            let Some((_, os_profile, instance_id)) = parse_snapshot_file_name(name) else {
                continue;
            };
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default();

            out.push(SnapshotInfo {
                name: name.to_string(),
                os_profile,
                instance_id,
                size_mb: ceil_mb(meta.len()),
                modified_at: epoch_secs_to_iso(modified),
            });
        }

        out.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    // ========================================================================
    // Internal (in-image) snapshots over the human monitor
    // ========================================================================

    /// Save an internal snapshot inside the instance's qcow2 image.
    pub async fn save_internal(&self, instance_id: &str, name: &str) -> Result<()> {
        let output = self.hmp(instance_id, &format!("savevm {}", name)).await?;
        check_hmp_output(&output)?;
        info!("Saved internal snapshot '{}' of {}", name, instance_id);
        Ok(())
    }

    /// Revert the running instance to an internal snapshot.
    pub async fn load_internal(&self, instance_id: &str, name: &str) -> Result<()> {
        let output = self.hmp(instance_id, &format!("loadvm {}", name)).await?;
        check_hmp_output(&output)?;
        info!("Loaded internal snapshot '{}' of {}", name, instance_id);
        Ok(())
    }

    /// Drop an internal snapshot.
    pub async fn delete_internal(&self, instance_id: &str, name: &str) -> Result<()> {
        let output = self.hmp(instance_id, &format!("delvm {}", name)).await?;
        check_hmp_output(&output)?;
        info!("Deleted internal snapshot '{}' of {}", name, instance_id);
        Ok(())
    }

    /// Internal snapshots present in the instance's image.
    pub async fn list_internal(&self, instance_id: &str) -> Result<Vec<InternalSnapshot>> {
        let output = self.hmp(instance_id, "info snapshots").await?;
        Ok(parse_info_snapshots(&output))
    }

    async fn hmp(&self, instance_id: &str, command_line: &str) -> Result<String> {
        let paths = InstancePaths::for_instance(&self.run_dir, instance_id);
        if !paths.qmp_socket.exists() {
            return Err(Error::VmNotRunning(instance_id.to_string()));
        }
        let client = QmpClient::new(
            &paths.qmp_socket,
            Duration::from_secs(self.timeouts.rpc_deadline_secs),
        );
        client.hmp(command_line).await
    }

    /// Expected snapshot path for an instance triplet.
    pub fn snapshot_path(&self, user_id: &str, os_profile: ProfileTag, instance_id: &str) -> PathBuf {
        self.snapshots_dir
            .join(snapshot_file_name(user_id, os_profile.as_str(), instance_id))
    }

    /// The image the bill is measured from, in priority order: the image
    /// the registry says the instance runs on, the instance's expected
    /// snapshot file, the overlay by convention. First existing regular
    /// file wins.
    fn billing_source(
        &self,
        user_id: &str,
        instance_id: &str,
        os_profile: ProfileTag,
    ) -> Result<Option<PathBuf>> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(record) = self.registry.get(instance_id)? {
            candidates.push(PathBuf::from(record.image_path));
        }
        candidates.push(self.snapshot_path(user_id, os_profile, instance_id));
        if let Ok(profile) = self.profiles.get(os_profile) {
            if let Ok(overlay) = profile.overlay_path(instance_id) {
                candidates.push(overlay);
            }
        }

        Ok(candidates.into_iter().find(|p| p.is_file()))
    }

    async fn wait_for_job(&self, client: &QmpClient, job_id: &str) -> Result<()> {
        let deadline = Duration::from_secs(self.timeouts.backup_deadline_secs);
        let started = Instant::now();

        loop {
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
            let jobs = client.query_block_jobs().await?;
            if !job_still_running(&jobs, job_id) {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(Error::Timeout {
                    seconds: self.timeouts.backup_deadline_secs,
                });
            }
            debug!("Backup job {} still running", job_id);
        }
    }

    async fn discard_file(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Discarded {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard {}: {}", path.display(), e),
        }
    }
}

/// One row of `info snapshots` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalSnapshot {
    pub id: String,
    pub tag: String,
}

/// The monitor reports failures as text; anything mentioning an error is
/// one.
fn check_hmp_output(output: &str) -> Result<()> {
    let trimmed = output.trim();
    if trimmed.to_ascii_lowercase().contains("error") {
        return Err(Error::Qmp(trimmed.to_string()));
    }
    Ok(())
}

/// Parse the monitor's `info snapshots` table: rows follow the header line
/// that starts with `ID`, first column id, second column tag.
fn parse_info_snapshots(output: &str) -> Vec<InternalSnapshot> {
    let mut rows = Vec::new();
    let mut in_table = false;
    for line in output.lines() {
        let line = line.trim();
        if !in_table {
            in_table = line.starts_with("ID");
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(id), Some(tag)) = (fields.next(), fields.next()) else {
            continue;
        };
        rows.push(InternalSnapshot {
            id: id.to_string(),
            tag: tag.to_string(),
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmshare_common::types::{now_ms, utc_now_iso, SessionRecord};
    use vmshare_common::Database;

    fn engine(root: &Path) -> (SnapshotEngine, SessionStore, UserStore) {
        let db = Database::open_memory().unwrap();
        let registry = SessionStore::new(&db);
        let users = UserStore::new(db.clone(), 300);
        let engine = SnapshotEngine::new(
            root.join("run"),
            root.join("snapshots"),
            TimeoutConfig::default(),
            ProfileTable::builtin(root),
            registry.clone(),
            users.clone(),
        );
        (engine, registry, users)
    }

    fn write_snapshot(dir: &Path, name: &str, mib: usize) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; mib * 1024 * 1024]).unwrap();
        path
    }

    #[tokio::test]
    async fn create_requires_running_control_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(dir.path());
        let err = engine
            .create_snapshot("u1", "nosock", ProfileTag::Alpine)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VmNotRunning(_)));
    }

    #[test]
    fn billing_source_priority() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, registry, _) = engine(dir.path());

        // Nothing exists yet.
        assert!(engine
            .billing_source("u1", "abc123", ProfileTag::Alpine)
            .unwrap()
            .is_none());

        // Overlay by convention is the last fallback.
        let overlay_dir = dir.path().join("overlays/Alpine");
        std::fs::create_dir_all(&overlay_dir).unwrap();
        let overlay = overlay_dir.join("alpine_abc123.qcow2");
        std::fs::write(&overlay, b"ov").unwrap();
        assert_eq!(
            engine
                .billing_source("u1", "abc123", ProfileTag::Alpine)
                .unwrap(),
            Some(overlay.clone())
        );

        // The expected snapshot file outranks the overlay.
        let snap = write_snapshot(
            &dir.path().join("snapshots"),
            "u1__alpine__abc123.qcow2",
            1,
        );
        assert_eq!(
            engine
                .billing_source("u1", "abc123", ProfileTag::Alpine)
                .unwrap(),
            Some(snap)
        );

        // The registry's image wins over both.
        let in_use = dir.path().join("in-use.qcow2");
        std::fs::write(&in_use, b"img").unwrap();
        registry
            .put(&SessionRecord {
                instance_id: "abc123".to_string(),
                user_id: "u1".to_string(),
                os_profile: ProfileTag::Alpine,
                image_path: in_use.display().to_string(),
                qmp_socket: "/run/vmshare/qmp-abc123.sock".to_string(),
                vnc_socket: "/run/vmshare/vnc-abc123.sock".to_string(),
                pid: 1,
                bridge_port: 7000,
                created_at: now_ms(),
                last_seen: now_ms(),
                state: "running".to_string(),
                started_at: utc_now_iso(),
            })
            .unwrap();
        assert_eq!(
            engine
                .billing_source("u1", "abc123", ProfileTag::Alpine)
                .unwrap(),
            Some(in_use)
        );
    }

    #[tokio::test]
    async fn create_over_quota_is_rejected_before_any_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, users) = engine(dir.path());
        users.set_capacity("u1", 1024).unwrap();
        users.add_stored("u1", 1000).unwrap();

        // Control socket present and a 60 MiB overlay to bill against.
        std::fs::create_dir_all(dir.path().join("run")).unwrap();
        std::fs::write(dir.path().join("run/qmp-abc123.sock"), b"").unwrap();
        let overlay_dir = dir.path().join("overlays/Alpine");
        std::fs::create_dir_all(&overlay_dir).unwrap();
        std::fs::write(
            overlay_dir.join("alpine_abc123.qcow2"),
            vec![0u8; 60 * 1024 * 1024],
        )
        .unwrap();

        let err = engine
            .create_snapshot("u1", "abc123", ProfileTag::Alpine)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        // The counters and the filesystem are unchanged.
        assert_eq!(users.quota("u1").unwrap().stored_mb, 1000);
        assert!(!engine
            .snapshot_path("u1", ProfileTag::Alpine, "abc123")
            .exists());
    }

    #[tokio::test]
    async fn remove_frees_quota_and_floors_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, users) = engine(dir.path());
        users.set_capacity("u1", 1024).unwrap();
        users.add_stored("u1", 100).unwrap();

        write_snapshot(&dir.path().join("snapshots"), "u1__alpine__abc123.qcow2", 60);

        let outcome = engine
            .remove_snapshot(
                "u1",
                RemoveTarget::Instance {
                    os_profile: ProfileTag::Alpine,
                    instance_id: "abc123".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(outcome.removed);
        assert_eq!(outcome.freed_mb, 60);
        assert_eq!(outcome.total_mb, 40);

        // Removing again: nothing on disk, stored untouched.
        let outcome = engine
            .remove_snapshot(
                "u1",
                RemoveTarget::Name("u1__alpine__abc123.qcow2".to_string()),
            )
            .await
            .unwrap();
        assert!(!outcome.removed);
        assert_eq!(outcome.freed_mb, 0);
        assert_eq!(outcome.total_mb, 40);
    }

    #[tokio::test]
    async fn remove_rejects_foreign_and_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(dir.path());

        assert!(matches!(
            engine
                .remove_snapshot("u1", RemoveTarget::Name("u2__alpine__abc.qcow2".to_string()))
                .await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            engine
                .remove_snapshot("u1", RemoveTarget::Name("u1__a__../../etc/x".to_string()))
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn list_reports_only_the_users_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(dir.path());
        let snaps = dir.path().join("snapshots");
        write_snapshot(&snaps, "u1__alpine__aaa.qcow2", 2);
        write_snapshot(&snaps, "u1__tiny__bbb.qcow2", 1);
        write_snapshot(&snaps, "u2__alpine__ccc.qcow2", 1);
        std::fs::write(snaps.join("not-a-snapshot.txt"), b"x").unwrap();

        let listed = engine.list_user_snapshots("u1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.name.starts_with("u1__")));
        let alpine = listed
            .iter()
            .find(|s| s.os_profile == "alpine")
            .unwrap();
        assert_eq!(alpine.instance_id, "aaa");
        assert_eq!(alpine.size_mb, 2);
        assert!(alpine.modified_at.ends_with('Z'));
    }

    #[tokio::test]
    async fn list_with_no_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(dir.path());
        assert!(engine.list_user_snapshots("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn internal_snapshot_ops_require_a_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(dir.path());
        assert!(matches!(
            engine.save_internal("nosock", "tag1").await,
            Err(Error::VmNotRunning(_))
        ));
        assert!(matches!(
            engine.list_internal("nosock").await,
            Err(Error::VmNotRunning(_))
        ));
    }

    #[test]
    fn hmp_errors_are_textual() {
        assert!(check_hmp_output("").is_ok());
        assert!(check_hmp_output("savevm done\n").is_ok());
        assert!(matches!(
            check_hmp_output("Error: snapshot not found\n"),
            Err(Error::Qmp(_))
        ));
    }

    #[test]
    fn info_snapshots_table_parses() {
        let output = "List of snapshots present on all disks:\n\
                      ID        TAG               VM SIZE                DATE     VM CLOCK\n\
                      1         clean              1.2 GiB 2024-01-01 12:00:00 00:01:02.345\n\
                      2         before-upgrade     1.3 GiB 2024-01-02 09:30:00 00:10:00.000\n";
        let rows = parse_info_snapshots(output);
        assert_eq!(
            rows,
            vec![
                InternalSnapshot {
                    id: "1".to_string(),
                    tag: "clean".to_string()
                },
                InternalSnapshot {
                    id: "2".to_string(),
                    tag: "before-upgrade".to_string()
                },
            ]
        );

        assert!(parse_info_snapshots("There is no snapshot available.\n").is_empty());
    }
}
