//! vmshare common library
//!
//! Shared types, configuration, errors, the QMP client and the embedded
//! state store used by the lifecycle core and the web shell.

pub mod config;
pub mod db;
pub mod error;
pub mod qmp;
pub mod types;

pub use config::{AppConfig, DisplayBackend, ProfileTable};
pub use db::{Database, UserQuota, UserStore};
pub use error::{Error, Result};
pub use qmp::QmpClient;
pub use types::*;

/// vmshare version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
