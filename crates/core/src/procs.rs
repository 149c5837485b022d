//! Process registry and signal plumbing
//!
//! In-process map of `{scope}:{instance_id}` to the handles the core owns:
//! the daemonized hypervisor's pid, or the bridge task's cancellation
//! token. This map is per worker process and is never consulted across
//! worker boundaries; cross-worker state lives in the registry.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Key scope for the hypervisor process of an instance.
pub fn hv_key(instance_id: &str) -> String {
    format!("hv:{}", instance_id)
}

/// Key scope for the display bridge of an instance.
pub fn ws_key(instance_id: &str) -> String {
    format!("ws:{}", instance_id)
}

/// A supervised handle: an external pid or an in-process task.
#[derive(Debug, Clone)]
pub enum ProcHandle {
    Pid(u32),
    Task(CancellationToken),
}

/// Tracks the processes and tasks owned by this worker.
#[derive(Default)]
pub struct ProcRegistry {
    procs: Mutex<HashMap<String, ProcHandle>>,
}

impl ProcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: String, handle: ProcHandle) {
        debug!("Registered process handle {}", key);
        self.procs.lock().insert(key, handle);
    }

    pub fn get(&self, key: &str) -> Option<ProcHandle> {
        self.procs.lock().get(key).cloned()
    }

    /// Terminate one entry and drop it. Pids get TERM; tasks are cancelled.
    pub fn stop(&self, key: &str) {
        let handle = self.procs.lock().remove(key);
        match handle {
            Some(ProcHandle::Pid(pid)) => {
                term(pid);
            }
            Some(ProcHandle::Task(token)) => {
                token.cancel();
            }
            None => {}
        }
    }

    /// Terminate everything, then KILL pid survivors after the grace period.
    pub async fn stop_all(&self, grace: Duration) {
        let drained: Vec<(String, ProcHandle)> = self.procs.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        info!("Stopping {} tracked processes", drained.len());

        let mut pids = Vec::new();
        for (key, handle) in drained {
            match handle {
                ProcHandle::Pid(pid) => {
                    term(pid);
                    pids.push((key, pid));
                }
                ProcHandle::Task(token) => token.cancel(),
            }
        }

        if pids.iter().any(|(_, pid)| pid_alive(*pid)) {
            tokio::time::sleep(grace).await;
        }
        for (key, pid) in pids {
            if pid_alive(pid) {
                warn!("Process {} ({}) survived TERM, sending KILL", pid, key);
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
    }
}

/// Deliver SIGTERM, logging delivery failures (already-gone is normal).
pub fn term(pid: u32) {
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => debug!("Sent TERM to pid {}", pid),
        Err(e) => debug!("TERM to pid {} failed: {}", pid, e),
    }
}

/// Signal-0 liveness probe.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped() {
        assert_eq!(hv_key("abc"), "hv:abc");
        assert_eq!(ws_key("abc"), "ws:abc");
    }

    #[test]
    fn own_pid_is_alive_and_zero_is_not() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn stop_cancels_tasks_and_removes_entries() {
        let registry = ProcRegistry::new();
        let token = CancellationToken::new();
        registry.set(ws_key("abc"), ProcHandle::Task(token.clone()));

        assert!(registry.get(&ws_key("abc")).is_some());
        registry.stop(&ws_key("abc"));
        assert!(token.is_cancelled());
        assert!(registry.get(&ws_key("abc")).is_none());

        // Stopping an absent key is a no-op.
        registry.stop(&ws_key("abc"));
    }

    #[tokio::test]
    async fn stop_all_drains_the_registry() {
        let registry = ProcRegistry::new();
        let token = CancellationToken::new();
        registry.set(ws_key("a"), ProcHandle::Task(token.clone()));
        // A pid that is long gone: TERM fails quietly, no grace wait needed.
        registry.set(hv_key("b"), ProcHandle::Pid(u32::MAX / 2));

        registry.stop_all(Duration::from_millis(10)).await;
        assert!(token.is_cancelled());
        assert!(registry.get(&ws_key("a")).is_none());
        assert!(registry.get(&hv_key("b")).is_none());
    }
}
