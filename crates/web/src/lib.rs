//! vmshare web shell
//!
//! Thin axum layer over the lifecycle core: authentication extraction,
//! the control HTTP surface, and the installer upload stream.

pub mod auth;
pub mod routes;

pub use routes::{router, AppState};
