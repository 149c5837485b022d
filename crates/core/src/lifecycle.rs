//! Lifecycle coordination
//!
//! The single entry point for launch, reclaim and shutdown. Owns the
//! decision to create or destroy an instance, enforces one VM per user,
//! serializes launch and reclaim per user, and is the only layer that
//! composes reclaim-on-failure. Bridge events drive disconnect cleanup.

use crate::bridge::{spawn_bridge, BridgeEvent, BridgeTarget};
use crate::images::ImageManager;
use crate::ports::{reserve_tcp_port, InstancePaths};
use crate::procs::{hv_key, term, ws_key, ProcHandle, ProcRegistry};
use crate::registry::SessionStore;
use crate::snapshot::{RemoveOutcome, RemoveTarget, SnapshotEngine, SnapshotOutcome};
use crate::supervisor::{InstallerDisks, Supervisor};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmshare_common::types::{
    confined_to, new_instance_id, now_ms, InstanceMeta, InstanceView, LaunchKind, LaunchRequest,
    OsProfile, ProfileTag, RecordPatch, SessionRecord, SnapshotInfo,
};
use vmshare_common::{
    AppConfig, Database, DisplayBackend, Error, QmpClient, Result, UserStore,
};

/// Default snapshot capacity granted to first-seen users, in MiB.
const DEFAULT_CAPACITY_MB: u64 = 300;

/// Deadline for the best-effort ACPI powerdown sent before TERM.
const POWERDOWN_DEADLINE: Duration = Duration::from_millis(500);

/// How many registry entries a logout sweeps per user.
const LOGOUT_SCAN: usize = 16;

/// The lifecycle coordinator. One per worker process; all durable state
/// lives in the registry.
pub struct Coordinator {
    config: AppConfig,
    images: ImageManager,
    supervisor: Supervisor,
    registry: SessionStore,
    snapshots: SnapshotEngine,
    procs: ProcRegistry,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    events_tx: mpsc::Sender<BridgeEvent>,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Build the coordinator and start its event loop. Requires a running
    /// tokio runtime.
    pub fn new(config: AppConfig) -> Result<Arc<Self>> {
        let db = Database::open(&config.database_path)?;
        let registry = SessionStore::new(&db);
        let users = UserStore::new(db, DEFAULT_CAPACITY_MB);

        let images = ImageManager::new(config.profiles.clone(), config.snapshots_dir.clone());
        let supervisor = Supervisor::new(config.run_dir.clone(), config.timeouts.clone());
        let snapshots = SnapshotEngine::new(
            config.run_dir.clone(),
            config.snapshots_dir.clone(),
            config.timeouts.clone(),
            config.profiles.clone(),
            registry.clone(),
            users,
        );

        let (events_tx, events_rx) = mpsc::channel(64);
        let coordinator = Arc::new(Self {
            config,
            images,
            supervisor,
            registry,
            snapshots,
            procs: ProcRegistry::new(),
            user_locks: DashMap::new(),
            events_tx,
            shutdown: CancellationToken::new(),
        });

        coordinator.clone().spawn_event_loop(events_rx);
        Ok(coordinator)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Launch a VM for the user, or return the one already running.
    pub async fn launch(&self, user_id: &str, request: LaunchRequest) -> Result<InstanceView> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.get_running_by_user(user_id)? {
            info!(
                "User {} already has instance {}, returning it",
                user_id, existing.instance_id
            );
            return Ok(InstanceView::from_record(
                &existing,
                &self.config.server.public_host,
            ));
        }

        let instance_id = new_instance_id();
        let profile = self.config.profiles.get(request.profile)?.clone();
        info!(
            "Launching {} instance {} for user {}",
            request.profile, instance_id, user_id
        );

        // Everything from here on can leave artifacts behind; failures roll
        // them back before the error is surfaced.
        let mut ephemeral: Vec<PathBuf> = Vec::new();
        let meta = match self
            .boot_instance(user_id, &instance_id, &profile, &request.kind, &mut ephemeral)
            .await
        {
            Ok(meta) => meta,
            Err(e) => {
                self.rollback(&instance_id, None, &ephemeral).await;
                return Err(e);
            }
        };
        self.procs
            .set(hv_key(&instance_id), ProcHandle::Pid(meta.pid));

        match self
            .publish_instance(user_id, &instance_id, request.profile, &meta)
            .await
        {
            Ok(view) => Ok(view),
            Err(e) => {
                self.rollback(&instance_id, Some(meta.pid), &ephemeral).await;
                Err(e)
            }
        }
    }

    /// Prepare the image and boot the hypervisor for one launch kind.
    /// Artifacts created along the way are pushed onto `ephemeral` so the
    /// caller can roll them back.
    async fn boot_instance(
        &self,
        user_id: &str,
        instance_id: &str,
        profile: &OsProfile,
        kind: &LaunchKind,
        ephemeral: &mut Vec<PathBuf>,
    ) -> Result<InstanceMeta> {
        match kind {
            LaunchKind::Profile => {
                if profile.is_installer_only() {
                    return Err(Error::ProfileIsInstallerOnly(profile.tag.to_string()));
                }
                let overlay = self.images.create_overlay(profile, instance_id).await?;
                ephemeral.push(overlay.clone());
                self.supervisor
                    .boot_overlay(user_id, instance_id, profile, &overlay, None)
                    .await
            }
            LaunchKind::Installer {
                data_disk_gb,
                install_target,
            } => {
                let installer = self
                    .images
                    .resolve_installer_image(profile, user_id)
                    .await?;
                self.images.validate_installer_image(&installer).await?;
                // The upload predates this launch, so it is not rolled
                // back; only reclaim of a published instance deletes it.

                let mut disks = InstallerDisks::default();
                // The install target is a pre-provisioned, user-owned disk;
                // it is never rolled back or reclaimed.
                if let Some(name) = install_target {
                    disks.install_target =
                        Some(self.images.resolve_install_target(profile, user_id, name)?);
                }
                if let Some(gb) = data_disk_gb {
                    let scratch = self
                        .images
                        .create_scratch_disk(profile, user_id, instance_id, *gb)
                        .await?;
                    ephemeral.push(scratch.clone());
                    disks.scratch = Some(scratch);
                }
                self.supervisor
                    .boot_installer(user_id, instance_id, profile, &installer, &disks, None)
                    .await
            }
            LaunchKind::Snapshot { name } => {
                let snapshot = self.images.resolve_snapshot(user_id, name)?;
                // Snapshot files are user-owned and never rolled back.
                self.supervisor
                    .boot_snapshot(user_id, instance_id, profile, &snapshot, None)
                    .await
            }
        }
    }

    /// Start the bridge and publish the registry record. The record is the
    /// last step, so a failure anywhere here leaves no registry entry.
    async fn publish_instance(
        &self,
        user_id: &str,
        instance_id: &str,
        os_profile: ProfileTag,
        meta: &InstanceMeta,
    ) -> Result<InstanceView> {
        let target = match self.config.server.default_backend {
            DisplayBackend::Unix => BridgeTarget::Unix(meta.vnc_socket.clone()),
            DisplayBackend::Tcp => BridgeTarget::Tcp(
                self.config.server.tcp_host.clone(),
                self.config.server.tcp_port,
            ),
        };

        // The port reservation is racy by contract; one retry with a fresh
        // port covers a lost race.
        let port = reserve_tcp_port()?;
        let handle = match spawn_bridge(
            instance_id.to_string(),
            port,
            target.clone(),
            self.events_tx.clone(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Bridge bind on port {} lost the race: {}", port, e);
                let port = reserve_tcp_port()?;
                spawn_bridge(
                    instance_id.to_string(),
                    port,
                    target,
                    self.events_tx.clone(),
                )
                .await?
            }
        };
        self.procs
            .set(ws_key(instance_id), ProcHandle::Task(handle.cancel.clone()));

        let now = now_ms();
        let record = SessionRecord {
            instance_id: instance_id.to_string(),
            user_id: user_id.to_string(),
            os_profile,
            image_path: meta.image_path.display().to_string(),
            qmp_socket: meta.qmp_socket.display().to_string(),
            vnc_socket: meta.vnc_socket.display().to_string(),
            pid: meta.pid,
            bridge_port: handle.port,
            created_at: now,
            last_seen: now,
            state: "running".to_string(),
            started_at: meta.started_at.clone(),
        };
        self.registry.put(&record)?;

        info!(
            "Instance {} for user {} is up (pid {}, bridge port {})",
            instance_id, user_id, meta.pid, handle.port
        );
        Ok(InstanceView::from_record(
            &record,
            &self.config.server.public_host,
        ))
    }

    /// Tear an instance down completely: processes, files, registry entry.
    /// Idempotent; a reclaim of an unknown id cleans residual files and
    /// returns. Cleanup failures are logged, never propagated.
    pub async fn reclaim(&self, instance_id: &str) -> Result<()> {
        let record = match self.registry.get(instance_id) {
            Ok(record) => record,
            Err(e) => {
                error!("Registry read during reclaim of {} failed: {}", instance_id, e);
                None
            }
        };

        let Some(record) = record else {
            info!("Reclaim of unknown instance {} is a no-op", instance_id);
            self.procs.stop(&ws_key(instance_id));
            self.procs.stop(&hv_key(instance_id));
            self.unlink_instance_files(instance_id);
            return Ok(());
        };

        let lock = self.user_lock(&record.user_id);
        let _guard = lock.lock().await;
        info!(
            "Reclaiming instance {} of user {}",
            instance_id, record.user_id
        );

        // Best-effort ACPI powerdown before signalling; an unresponsive
        // guest just falls through to TERM.
        let paths = InstancePaths::for_instance(&self.config.run_dir, instance_id);
        if paths.qmp_socket.exists() {
            let client = QmpClient::new(&paths.qmp_socket, POWERDOWN_DEADLINE);
            if let Err(e) = client.system_powerdown().await {
                debug!("Powerdown request for {} failed: {}", instance_id, e);
            }
        }

        self.procs.stop(&ws_key(instance_id));
        self.procs.stop(&hv_key(instance_id));
        if record.pid != 0 {
            term(record.pid);
        }

        self.delete_ephemeral_images(&record).await;
        self.unlink_instance_files(instance_id);

        if let Err(e) = self.registry.delete(instance_id) {
            error!("Registry delete of {} failed: {}", instance_id, e);
        }
        Ok(())
    }

    /// Reclaim everything the registry knows about. Never fails.
    pub async fn shutdown_all(&self) {
        let items = match self.registry.items() {
            Ok(items) => items,
            Err(e) => {
                error!("Registry enumeration during shutdown failed: {}", e);
                Vec::new()
            }
        };
        info!("Shutting down {} instances", items.len());
        for record in items {
            if let Err(e) = self.reclaim(&record.instance_id).await {
                warn!("Reclaim of {} during shutdown: {}", record.instance_id, e);
            }
        }

        self.procs
            .stop_all(Duration::from_secs(self.config.timeouts.shutdown_grace_secs))
            .await;
        self.shutdown.cancel();
    }

    /// Reclaim whatever the user has running. Never fails the caller.
    pub async fn logout(&self, user_id: &str) {
        let ids = match self.registry.user_instances(user_id, LOGOUT_SCAN) {
            Ok(ids) => ids,
            Err(e) => {
                error!("Registry scan during logout of {} failed: {}", user_id, e);
                return;
            }
        };
        for id in ids {
            if let Err(e) = self.reclaim(&id).await {
                warn!("Reclaim of {} during logout: {}", id, e);
            }
        }
    }

    /// Snapshot the user's running VM (or the named instance).
    pub async fn create_snapshot(
        &self,
        user_id: &str,
        os_profile: ProfileTag,
        instance_id: Option<String>,
    ) -> Result<SnapshotOutcome> {
        let instance_id = match instance_id {
            Some(id) => id,
            None => self
                .registry
                .get_running_by_user(user_id)?
                .ok_or_else(|| Error::NoRunningVm(user_id.to_string()))?
                .instance_id,
        };
        self.snapshots
            .create_snapshot(user_id, &instance_id, os_profile)
            .await
    }

    pub async fn remove_snapshot(
        &self,
        user_id: &str,
        target: RemoveTarget,
    ) -> Result<RemoveOutcome> {
        self.snapshots.remove_snapshot(user_id, target).await
    }

    pub async fn list_user_snapshots(&self, user_id: &str) -> Result<Vec<SnapshotInfo>> {
        self.snapshots.list_user_snapshots(user_id).await
    }

    /// Where the user's installer image is (or will be) stored.
    pub fn installer_upload_path(&self, user_id: &str) -> Result<PathBuf> {
        let profile = self.config.profiles.get(ProfileTag::Custom)?;
        Ok(self.images.installer_destination(profile, user_id))
    }

    /// Active sessions, newest first, optionally filtered by user.
    pub fn active_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InstanceView>> {
        let views = self
            .registry
            .items()?
            .into_iter()
            .filter(|r| user_id.map_or(true, |uid| r.user_id == uid))
            .take(limit)
            .map(|r| InstanceView::from_record(&r, &self.config.server.public_host))
            .collect();
        Ok(views)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn spawn_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<BridgeEvent>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Coordinator event loop stopped");
        });
    }

    async fn handle_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Attached { instance_id } => {
                self.touch(&instance_id);
            }
            BridgeEvent::Detached { instance_id } => {
                info!("Client detached from {}, reclaiming", instance_id);
                self.touch(&instance_id);
                if let Err(e) = self.reclaim(&instance_id).await {
                    warn!("Disconnect-driven reclaim of {}: {}", instance_id, e);
                }
            }
            BridgeEvent::BridgeExited { instance_id } => {
                warn!("Bridge for {} exited, reclaiming", instance_id);
                if let Err(e) = self.reclaim(&instance_id).await {
                    warn!("Bridge-exit reclaim of {}: {}", instance_id, e);
                }
            }
        }
    }

    fn touch(&self, instance_id: &str) {
        let patch = RecordPatch {
            last_seen: Some(now_ms()),
            ..Default::default()
        };
        if let Err(e) = self.registry.update(instance_id, &patch) {
            warn!("last_seen update for {} failed: {}", instance_id, e);
        }
    }

    /// Roll back a partially launched instance: processes, ephemeral
    /// images, runtime files, and (normally absent) registry entry.
    async fn rollback(&self, instance_id: &str, pid: Option<u32>, ephemeral: &[PathBuf]) {
        warn!("Rolling back failed launch of {}", instance_id);
        self.procs.stop(&ws_key(instance_id));
        self.procs.stop(&hv_key(instance_id));
        if let Some(pid) = pid {
            term(pid);
        }
        for path in ephemeral {
            self.remove_file_logged(path).await;
        }
        self.unlink_instance_files(instance_id);
        if let Err(e) = self.registry.delete(instance_id) {
            error!("Registry delete during rollback of {} failed: {}", instance_id, e);
        }
    }

    /// Delete the images reclaim is allowed to: overlays and installer
    /// artifacts. Snapshot files are user-owned and always survive.
    async fn delete_ephemeral_images(&self, record: &SessionRecord) {
        let image = Path::new(&record.image_path);
        if confined_to(&self.config.snapshots_dir, image) {
            debug!(
                "Keeping snapshot image {} of instance {}",
                record.image_path, record.instance_id
            );
        } else {
            self.remove_file_logged(image).await;
        }

        if record.os_profile == ProfileTag::Custom {
            if let Ok(profile) = self.config.profiles.get(ProfileTag::Custom) {
                let scratch = self.images.scratch_disk_path(
                    profile,
                    &record.user_id,
                    &record.instance_id,
                );
                self.remove_file_logged(&scratch).await;
            }
        }
    }

    fn unlink_instance_files(&self, instance_id: &str) {
        let paths = InstancePaths::for_instance(&self.config.run_dir, instance_id);
        for (path, err) in paths.unlink_all() {
            warn!("Failed to unlink {}: {}", path.display(), err);
        }
    }

    async fn remove_file_logged(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("Deleted {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmshare_common::types::utc_now_iso;

    fn coordinator(root: &Path) -> Arc<Coordinator> {
        Coordinator::new(AppConfig::rooted_at(root, "test-secret")).unwrap()
    }

    /// A record whose pid and sockets read as live from this process.
    fn live_record(coordinator: &Coordinator, id: &str, user: &str, port: u16) -> SessionRecord {
        let paths = InstancePaths::for_instance(&coordinator.config.run_dir, id);
        std::fs::create_dir_all(&coordinator.config.run_dir).unwrap();
        std::fs::write(&paths.qmp_socket, b"").unwrap();
        std::fs::write(&paths.vnc_socket, b"").unwrap();

        SessionRecord {
            instance_id: id.to_string(),
            user_id: user.to_string(),
            os_profile: ProfileTag::Alpine,
            image_path: format!("/var/ov/alpine_{id}.qcow2"),
            qmp_socket: paths.qmp_socket.display().to_string(),
            vnc_socket: paths.vnc_socket.display().to_string(),
            pid: std::process::id(),
            bridge_port: port,
            created_at: now_ms(),
            last_seen: now_ms(),
            state: "running".to_string(),
            started_at: utc_now_iso(),
        }
    }

    #[tokio::test]
    async fn launch_returns_existing_instance_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        let existing = live_record(&coordinator, "oldvm0000000", "u1", 7001);
        coordinator.registry.put(&existing).unwrap();

        // No hypervisor is spawned for an existing session, so this
        // succeeds even though no QEMU binary ever runs in this test.
        let view = coordinator
            .launch(
                "u1",
                LaunchRequest {
                    profile: ProfileTag::Alpine,
                    kind: LaunchKind::Profile,
                },
            )
            .await
            .unwrap();

        assert_eq!(view.instance_id, "oldvm0000000");
        assert_eq!(view.bridge_port, 7001);
        assert!(view.redirect_url.ends_with("port=7001"));
        assert_eq!(coordinator.registry.items().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_launches_return_the_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        coordinator
            .registry
            .put(&live_record(&coordinator, "oldvm0000000", "u1", 7001))
            .unwrap();

        let request = || LaunchRequest {
            profile: ProfileTag::Alpine,
            kind: LaunchKind::Profile,
        };
        let a = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.launch("u1", request()).await })
        };
        let b = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.launch("u1", request()).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.instance_id, "oldvm0000000");
        assert_eq!(b.instance_id, "oldvm0000000");
        assert_eq!(coordinator.registry.items().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn custom_profile_rejects_overlay_boots() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        let err = coordinator
            .launch(
                "u1",
                LaunchRequest {
                    profile: ProfileTag::Custom,
                    kind: LaunchKind::Profile,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProfileIsInstallerOnly(_)));
        assert!(coordinator.registry.items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn installer_launch_requires_the_named_install_target() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        // A valid uploaded installer image for u1.
        let custom_dir = dir.path().join("custom");
        std::fs::create_dir_all(&custom_dir).unwrap();
        let mut iso = vec![0u8; 10 * 1024 * 1024];
        iso[0x8001..0x8006].copy_from_slice(b"CD001");
        std::fs::write(custom_dir.join("u1.iso"), &iso).unwrap();

        let err = coordinator
            .launch(
                "u1",
                LaunchRequest {
                    profile: ProfileTag::Custom,
                    kind: LaunchKind::Installer {
                        data_disk_gb: None,
                        install_target: Some("work".to_string()),
                    },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(_)));

        // Nothing was spawned or published, and the uploaded image is kept.
        assert!(coordinator.registry.items().unwrap().is_empty());
        assert!(custom_dir.join("u1.iso").exists());
    }

    #[tokio::test]
    async fn failed_launch_leaves_no_registry_entry_and_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        // A one-byte "snapshot" exists, so resolution succeeds and the
        // launch proceeds to the hypervisor spawn, which fails either
        // because the binary is absent or because the image is garbage.
        std::fs::create_dir_all(&coordinator.config.snapshots_dir).unwrap();
        std::fs::write(
            coordinator.config.snapshots_dir.join("u1__alpine__bad.qcow2"),
            b"x",
        )
        .unwrap();

        let result = coordinator
            .launch(
                "u1",
                LaunchRequest {
                    profile: ProfileTag::Alpine,
                    kind: LaunchKind::Snapshot {
                        name: "u1__alpine__bad".to_string(),
                    },
                },
            )
            .await;
        assert!(result.is_err());

        assert!(coordinator.registry.items().unwrap().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(&coordinator.config.run_dir)
            .map(|d| d.flatten().collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "run dir not empty: {leftovers:?}");
        // The snapshot file itself is user-owned and survives the failure.
        assert!(coordinator
            .config
            .snapshots_dir
            .join("u1__alpine__bad.qcow2")
            .exists());
    }

    #[tokio::test]
    async fn reclaim_is_idempotent_and_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        let mut record = live_record(&coordinator, "gone00000000", "u1", 7002);
        // A pid nobody owns: TERM delivery fails quietly.
        record.pid = u32::MAX / 2 | 1;
        let overlay = dir.path().join("alpine_gone.qcow2");
        std::fs::write(&overlay, b"ov").unwrap();
        record.image_path = overlay.display().to_string();
        coordinator.registry.put(&record).unwrap();

        coordinator.reclaim("gone00000000").await.unwrap();
        assert!(coordinator.registry.get("gone00000000").unwrap().is_none());
        assert!(!overlay.exists());
        let paths = InstancePaths::for_instance(&coordinator.config.run_dir, "gone00000000");
        assert!(!paths.qmp_socket.exists());
        assert!(!paths.vnc_socket.exists());

        // Second reclaim is a logged no-op.
        coordinator.reclaim("gone00000000").await.unwrap();
    }

    #[tokio::test]
    async fn reclaim_never_deletes_snapshot_images() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        std::fs::create_dir_all(&coordinator.config.snapshots_dir).unwrap();
        let snapshot = coordinator
            .config
            .snapshots_dir
            .join("u1__alpine__snapvm.qcow2");
        std::fs::write(&snapshot, b"snap").unwrap();

        let mut record = live_record(&coordinator, "snapvm000000", "u1", 7003);
        record.pid = u32::MAX / 2 | 1;
        record.image_path = snapshot.display().to_string();
        coordinator.registry.put(&record).unwrap();

        coordinator.reclaim("snapvm000000").await.unwrap();
        assert!(snapshot.exists());
        assert!(coordinator.registry.get("snapvm000000").unwrap().is_none());
    }

    #[tokio::test]
    async fn detach_event_drives_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        let mut record = live_record(&coordinator, "detach000000", "u1", 7004);
        record.pid = u32::MAX / 2 | 1;
        coordinator.registry.put(&record).unwrap();

        coordinator
            .handle_event(BridgeEvent::Detached {
                instance_id: "detach000000".to_string(),
            })
            .await;

        assert!(coordinator.registry.get("detach000000").unwrap().is_none());
        let paths = InstancePaths::for_instance(&coordinator.config.run_dir, "detach000000");
        assert!(!paths.qmp_socket.exists());
    }

    #[tokio::test]
    async fn logout_and_shutdown_never_fail() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());

        let mut record = live_record(&coordinator, "bye000000000", "u1", 7005);
        record.pid = u32::MAX / 2 | 1;
        coordinator.registry.put(&record).unwrap();

        coordinator.logout("u1").await;
        assert!(coordinator.registry.items().unwrap().is_empty());

        // Logout with nothing running is fine too.
        coordinator.logout("u1").await;
        coordinator.shutdown_all().await;
    }

    #[tokio::test]
    async fn snapshot_without_running_vm_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        let err = coordinator
            .create_snapshot("u1", ProfileTag::Alpine, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRunningVm(_)));
    }

    #[tokio::test]
    async fn active_sessions_filter_by_user() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        coordinator
            .registry
            .put(&live_record(&coordinator, "aaa000000000", "u1", 7006))
            .unwrap();
        coordinator
            .registry
            .put(&live_record(&coordinator, "bbb000000000", "u2", 7007))
            .unwrap();

        assert_eq!(coordinator.active_sessions(None, 10).unwrap().len(), 2);
        let filtered = coordinator.active_sessions(Some("u2"), 10).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].user_id, "u2");
        assert_eq!(coordinator.active_sessions(None, 1).unwrap().len(), 1);
    }
}
