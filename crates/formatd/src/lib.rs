//! formatd: session client for long-lived external formatter daemons.

pub mod bridge;
pub mod config;
pub mod logging;
pub mod session;
pub mod supervisor;
pub mod table;

pub use bridge::protocol::{PayloadEncoding, RequestId, WireCodec};
pub use config::{ConfigError, SessionConfig};
pub use session::{Session, SessionError, SessionSnapshot, SessionState};
pub use supervisor::{
    CommandSpawner, DaemonChild, DaemonExit, DaemonId, DaemonSpawner, LaunchSpec, SpawnError,
    SpawnedDaemon,
};
pub use table::{PendingGuard, RequestTable, Routed};
pub use tokio_util::sync::CancellationToken;

/// Crate version, reported by `formatd --version`.
pub const FORMATD_VERSION: &str = env!("CARGO_PKG_VERSION");
