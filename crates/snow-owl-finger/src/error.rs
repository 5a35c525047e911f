//! Error types for the finger daemon
//!
//! NIST 800-53: SI-11 (Error Handling)
//! Only operator-facing paths produce these errors. Failures caused by a
//! remote client are degraded in place and never leave the connection handler.

use thiserror::Error;

/// Result type alias for finger daemon operations
pub type Result<T> = std::result::Result<T, FingerError>;

#[derive(Error, Debug)]
pub enum FingerError {
    /// Invalid or unusable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A listening socket could not be created or adopted
    #[error("Listener error ({family}): {message}")]
    Listener { family: String, message: String },

    /// The inherited socket manifest from a previous generation is corrupt
    #[error("Inherited socket manifest error: {0}")]
    Manifest(String),

    /// Identity change or re-exec failed
    #[error("Privilege drop failed: {0}")]
    PrivilegeDrop(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FingerError {
    /// Errors which must stop the daemon from starting
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            FingerError::Config(_) | FingerError::Manifest(_) | FingerError::PrivilegeDrop(_)
        )
    }

    pub(crate) fn listener(family: impl ToString, message: impl Into<String>) -> Self {
        FingerError::Listener {
            family: family.to_string(),
            message: message.into(),
        }
    }
}
