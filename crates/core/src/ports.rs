//! Port reservation and per-instance runtime paths
//!
//! Bridge ports come from the host's ephemeral pool by binding and
//! immediately releasing a loopback socket; the reservation is racy by
//! contract and callers retry if the later bind fails. Socket and pidfile
//! paths are deterministic per instance id.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use vmshare_common::Result;

/// Reserve a currently-free TCP port on localhost.
pub fn reserve_tcp_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Per-instance runtime file locations under the run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub vnc_socket: PathBuf,
    pub qmp_socket: PathBuf,
    pub pidfile: PathBuf,
}

impl InstancePaths {
    pub fn for_instance(run_dir: &Path, instance_id: &str) -> Self {
        Self {
            vnc_socket: run_dir.join(format!("vnc-{}.sock", instance_id)),
            qmp_socket: run_dir.join(format!("qmp-{}.sock", instance_id)),
            pidfile: run_dir.join(format!("qemu-{}.pid", instance_id)),
        }
    }

    /// Unlink whatever is left of the three files. Missing files are fine;
    /// other failures are reported so reclaim can log and continue.
    pub fn unlink_all(&self) -> Vec<(PathBuf, std::io::Error)> {
        let mut failures = Vec::new();
        for path in [&self.vnc_socket, &self.qmp_socket, &self.pidfile] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => failures.push((path.clone(), e)),
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ports_are_bindable_once_released() {
        let port = reserve_tcp_port().unwrap();
        assert!(port > 0);
        // The reservation released the socket, so a fresh bind succeeds.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn paths_are_deterministic_and_namespaced() {
        let a = InstancePaths::for_instance(Path::new("/run/vmshare"), "deadbe");
        assert_eq!(a.vnc_socket, PathBuf::from("/run/vmshare/vnc-deadbe.sock"));
        assert_eq!(a.qmp_socket, PathBuf::from("/run/vmshare/qmp-deadbe.sock"));
        assert_eq!(a.pidfile, PathBuf::from("/run/vmshare/qemu-deadbe.pid"));

        let b = InstancePaths::for_instance(Path::new("/run/vmshare"), "f00f00");
        assert_ne!(a, b);
    }

    #[test]
    fn unlink_all_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::for_instance(dir.path(), "abc123");
        std::fs::write(&paths.pidfile, "123").unwrap();

        let failures = paths.unlink_all();
        assert!(failures.is_empty());
        assert!(!paths.pidfile.exists());

        // Second pass is a no-op.
        assert!(paths.unlink_all().is_empty());
    }
}
