//! # Snow Owl Finger
//!
//! RFC 1288 finger daemon that publishes `.plan`, `.project` and `.pubkey`
//! files for local users and nothing else.
//!
//! ## Security posture
//!
//! - Local users are never enumerated; listing requests get a fixed denial
//! - Every negative lookup produces the same "no such user" text
//! - Served files must be regular, non-empty, under a size limit and owned
//!   by the account they are served for
//! - Sockets are bound as root, then the process switches to an
//!   unprivileged identity and re-executes itself, keeping the sockets
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege),
//! AU-2 (Audit Events), SC-5 (Denial of Service Protection)

pub mod accounts;
pub mod alias_watcher;
pub mod aliases;
pub mod audit;
pub mod config;
pub mod connection;
pub mod error;
pub mod file_server;
pub mod listener;
pub mod privdrop;
pub mod reaper;
pub mod resolver;
pub mod response;
pub mod server;

pub use aliases::{AliasMap, AliasStore, AliasTarget};
pub use config::{FingerConfig, LogFormat, LoggingConfig};
pub use connection::{ConnectionInfo, FingerContext, handle_connection};
pub use error::{FingerError, Result};
pub use listener::{AddressFamily, ListenSocket, bind_all};
pub use privdrop::{DropTarget, FdManifest, PrivilegeSeparation, ReexecHandoff};
pub use resolver::{UserRecord, UserResolver};
pub use server::FingerServer;

/// Pause before exiting on a fatal startup error, so a supervisor that
/// restarts us immediately does not spin.
pub const FATAL_EXIT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
