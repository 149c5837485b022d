//! vmshare lifecycle core
//!
//! Provisions copy-on-write overlays, supervises QEMU instances with
//! per-instance control and display sockets, bridges display sockets to
//! WebSocket endpoints, takes live disk snapshots over QMP, and keeps the
//! durable session registry consistent through launch, disconnect and
//! shutdown.

pub mod bridge;
pub mod images;
pub mod lifecycle;
pub mod ports;
pub mod procs;
pub mod registry;
pub mod snapshot;
pub mod supervisor;

pub use bridge::{BridgeEvent, BridgeHandle, BridgeTarget};
pub use images::ImageManager;
pub use lifecycle::Coordinator;
pub use ports::{reserve_tcp_port, InstancePaths};
pub use procs::ProcRegistry;
pub use registry::SessionStore;
pub use snapshot::{InternalSnapshot, RemoveOutcome, RemoveTarget, SnapshotEngine, SnapshotOutcome};
pub use supervisor::Supervisor;
