use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{Level, event};

/// Security audit event types for SIEM integration
///
/// NIST 800-53 Controls:
/// - AU-2: Audit Events (comprehensive event catalog)
/// - AU-3: Content of Audit Records (structured event data)
/// - AU-12: Audit Generation (automatic event generation)
///
/// STIG V-222563: Applications must produce audit records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Server started accepting connections
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        listeners: Vec<String>,
        version: String,
    },

    /// Server finished draining and is exiting
    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    /// Listening sockets adopted from the previous process generation
    ListenersRecovered {
        #[serde(flatten)]
        common: CommonFields,
        count: usize,
    },

    /// Switching from root to the configured runtime identity
    PrivilegeDrop {
        #[serde(flatten)]
        common: CommonFields,
        run_as_user: String,
        uid: u32,
        gid: u32,
        listeners: usize,
    },

    /// A request to enumerate local users was refused
    ListingDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        long: bool,
    },

    /// A requested user did not resolve (for any reason)
    UnknownUser {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        username: String,
    },

    /// A served file was not owned by the user it was served for
    OwnershipViolation {
        #[serde(flatten)]
        common: CommonFields,
        file: String,
        owner_uid: u32,
        expected_uid: u32,
    },

    /// A file was larger than the configured limit
    FileSizeLimitExceeded {
        #[serde(flatten)]
        common: CommonFields,
        file: String,
        file_size: u64,
        max_allowed: u64,
    },

    /// Oversize, unterminated or otherwise unusable request
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },

    /// Alias file parsed and swapped in
    AliasesLoaded {
        #[serde(flatten)]
        common: CommonFields,
        alias_file: String,
        alias_count: usize,
    },

    /// Fatal configuration problem
    ConfigurationError {
        #[serde(flatten)]
        common: CommonFields,
        error: String,
    },
}

/// Common fields present in all audit events
///
/// NIST 800-53 AU-3: Content of Audit Records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// Severity level (info, warn, error)
    pub severity: String,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "snow-owl-finger".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    /// Log this audit event using structured tracing
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(target: "audit", Level::ERROR, audit_event = %json),
            "warn" => event!(target: "audit", Level::WARN, audit_event = %json),
            _ => event!(target: "audit", Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ListenersRecovered { common, .. }
            | AuditEvent::PrivilegeDrop { common, .. }
            | AuditEvent::ListingDenied { common, .. }
            | AuditEvent::UnknownUser { common, .. }
            | AuditEvent::OwnershipViolation { common, .. }
            | AuditEvent::FileSizeLimitExceeded { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::AliasesLoaded { common, .. }
            | AuditEvent::ConfigurationError { common, .. } => common,
        }
    }
}

/// Audit logger for finger operations
///
/// Remote misbehaviour never rises above info: nothing a remote client
/// does warrants an error-level record on our side. Local security
/// violations are warnings.
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(listeners: &[SocketAddr]) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            listeners: listeners.iter().map(ToString::to_string).collect(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
        .log();
    }

    pub fn server_shutdown(reason: &str) {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn listeners_recovered(count: usize) {
        AuditEvent::ListenersRecovered {
            common: CommonFields::new("info"),
            count,
        }
        .log();
    }

    pub fn privilege_drop(run_as_user: &str, uid: u32, gid: u32, listeners: usize) {
        AuditEvent::PrivilegeDrop {
            common: CommonFields::new("info"),
            run_as_user: run_as_user.to_string(),
            uid,
            gid,
            listeners,
        }
        .log();
    }

    pub fn listing_denied(client_addr: SocketAddr, long: bool) {
        AuditEvent::ListingDenied {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            long,
        }
        .log();
    }

    pub fn unknown_user(client_addr: SocketAddr, username: &str) {
        AuditEvent::UnknownUser {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            username: username.to_string(),
        }
        .log();
    }

    /// Log a probable local-account attack (symlink or hardlink substitution)
    pub fn ownership_violation(file: &Path, owner_uid: u32, expected_uid: u32) {
        AuditEvent::OwnershipViolation {
            common: CommonFields::new("warn"),
            file: file.display().to_string(),
            owner_uid,
            expected_uid,
        }
        .log();
    }

    pub fn file_size_limit_exceeded(file: &Path, file_size: u64, max_allowed: u64) {
        AuditEvent::FileSizeLimitExceeded {
            common: CommonFields::new("info"),
            file: file.display().to_string(),
            file_size,
            max_allowed,
        }
        .log();
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }

    pub fn aliases_loaded(alias_file: &Path, alias_count: usize) {
        AuditEvent::AliasesLoaded {
            common: CommonFields::new("info"),
            alias_file: alias_file.display().to_string(),
            alias_count,
        }
        .log();
    }

    pub fn configuration_error(error: &str) {
        AuditEvent::ConfigurationError {
            common: CommonFields::new("error"),
            error: error.to_string(),
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag_and_common_fields()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let event = AuditEvent::OwnershipViolation {
            common: CommonFields::new("warn"),
            file: "/home/alice/.plan".to_string(),
            owner_uid: 1001,
            expected_uid: 1000,
        };
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event)?)?;
        assert_eq!(value["event_type"], "ownership_violation");
        assert_eq!(value["service"], "snow-owl-finger");
        assert_eq!(value["severity"], "warn");
        assert_eq!(value["owner_uid"], 1001);
        assert_eq!(value["expected_uid"], 1000);
        Ok(())
    }

    #[test]
    fn test_listing_denied_records_long_mode() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let event = AuditEvent::ListingDenied {
            common: CommonFields::new("info"),
            client_addr: "192.0.2.7:5050".to_string(),
            long: true,
        };
        let value = serde_json::to_value(&event)?;
        assert_eq!(value["event_type"], "listing_denied");
        assert_eq!(value["long"], true);
        assert_eq!(event.common().severity, "info");
        Ok(())
    }
}
