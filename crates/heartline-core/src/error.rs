//! Error types shared by hub and member.

use thiserror::Error;

/// HTTP status a hub answers with when the upgrade gate rejects a request.
pub const REJECTION_STATUS: u16 = 403;

/// Lifecycle errors surfaced to member callers.
///
/// `Clone` so that a single fatal error can be handed to every queued
/// readiness waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The hub refused the upgrade. Terminal: no further reconnects.
    #[error("Upgrade rejected by hub (HTTP {status})")]
    Rejected { status: u16 },

    /// `ready()` was called before any connection attempt was started.
    #[error("Not connecting: call connect() before waiting for readiness")]
    NotConnecting,

    /// A send was attempted while no connection is open.
    #[error("Not connected")]
    NotConnected,

    /// Reconnect attempts ran out.
    #[error("Gave up reconnecting after {attempts} attempt(s)")]
    Exhausted { attempts: u32 },

    /// The member (or hub) was destroyed.
    #[error("Connection destroyed")]
    Destroyed,

    /// Any other transport failure. Not fatal.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl LinkError {
    /// Whether this error ends the member's lifecycle for good.
    ///
    /// Only a 403 upgrade response qualifies; other statuses may be transient.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Rejected { status } if *status == REJECTION_STATUS)
    }
}

/// Configuration validation and loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rejection_is_fatal() {
        assert!(LinkError::Rejected { status: 403 }.is_fatal());
        assert!(!LinkError::Rejected { status: 503 }.is_fatal());
        assert!(!LinkError::NotConnecting.is_fatal());
        assert!(!LinkError::Exhausted { attempts: 3 }.is_fatal());
        assert!(!LinkError::Transport("reset".into()).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            LinkError::Rejected { status: 403 }.to_string(),
            "Upgrade rejected by hub (HTTP 403)"
        );
        assert_eq!(
            LinkError::Exhausted { attempts: 2 }.to_string(),
            "Gave up reconnecting after 2 attempt(s)"
        );
    }
}
