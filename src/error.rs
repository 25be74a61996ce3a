//! Error types for the pool membership service
//!
//! Every rejection the service can produce is a distinct variant so callers
//! branch on the kind of failure rather than on "something went wrong".

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the service
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Access denied: uid {uid} gid {gid} may not connect to pool {pool} with {requested}")]
    AccessDenied {
        pool: String,
        uid: u32,
        gid: u32,
        requested: String,
    },

    #[error("Pool not found: {pool}")]
    PoolNotFound { pool: String },

    #[error("Server group mismatch for pool {pool}: requested {requested}, pool belongs to {actual}")]
    ServerGroupMismatch {
        pool: String,
        requested: String,
        actual: String,
    },

    #[error("Pool {pool} still has {handles} connected handle(s)")]
    PoolNotEmpty { pool: String, handles: usize },

    #[error("Handle {handle} is no longer connected")]
    HandleEvicted { handle: String },

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Server group unreachable: {group}")]
    ServerGroupUnreachable { group: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Revocation delivery failed for handle {handle}: {reason}")]
    Notification { handle: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// An error reported by a remote pool service
    #[error("{message}")]
    Api { kind: String, message: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a caller should do after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Terminal, retrying cannot succeed
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        if self.is_transient() {
            ErrorAction::RetryWithBackoff
        } else {
            ErrorAction::NoRetry
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api { kind, .. } => is_transient_kind(kind),
            _ => is_transient_kind(self.kind()),
        }
    }

    /// Stable machine-readable code for this error
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidParameter(_) => "invalid_parameter",
            Error::AccessDenied { .. } => "access_denied",
            Error::PoolNotFound { .. } => "pool_not_found",
            Error::ServerGroupMismatch { .. } => "server_group_mismatch",
            Error::PoolNotEmpty { .. } => "pool_not_empty",
            Error::HandleEvicted { .. } => "handle_evicted",
            Error::CapacityParse(_) => "invalid_capacity",
            Error::ServerGroupUnreachable { .. } => "server_group_unreachable",
            Error::Timeout { .. } => "timeout",
            Error::Notification { .. } => "notification_failed",
            Error::Http(_) => "http_error",
            Error::Api { kind, .. } => KINDS
                .iter()
                .find(|(known, _)| *known == kind.as_str())
                .map(|(known, _)| *known)
                .unwrap_or("remote_error"),
            Error::Internal(_) => "internal_error",
            Error::Configuration(_) | Error::ConfigParse(_) => "configuration_error",
            Error::Io(_) => "io_error",
        }
    }

    /// Process exit code for the command surface. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        let kind = self.kind();
        KINDS
            .iter()
            .find(|(known, _)| *known == kind)
            .map(|(_, code)| *code)
            .unwrap_or(1)
    }

    pub(crate) fn pool_not_found(pool: impl ToString) -> Self {
        Error::PoolNotFound {
            pool: pool.to_string(),
        }
    }
}

/// Error kinds with a dedicated exit code
const KINDS: &[(&str, i32)] = &[
    ("invalid_parameter", 2),
    ("invalid_capacity", 2),
    ("access_denied", 3),
    ("pool_not_found", 4),
    ("server_group_mismatch", 5),
    ("pool_not_empty", 6),
    ("handle_evicted", 7),
    ("server_group_unreachable", 8),
    ("timeout", 9),
    ("configuration_error", 78),
];

fn is_transient_kind(kind: &str) -> bool {
    matches!(
        kind,
        "server_group_unreachable" | "timeout" | "notification_failed" | "http_error"
    )
}

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Timeout {
            operation: "allocate".into(),
            after: Duration::from_secs(5),
        };
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);

        let err = Error::PoolNotEmpty {
            pool: "p".into(),
            handles: 2,
        };
        assert_eq!(err.action(), ErrorAction::NoRetry);

        let err = Error::AccessDenied {
            pool: "p".into(),
            uid: 1,
            gid: 1,
            requested: "rw".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRetry);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::ServerGroupUnreachable {
            group: "daos_server".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let missing = Error::pool_not_found("44be6958-40f4-b6ed-a581-b461a4d4c570");
        assert!(!missing.is_retryable());
        assert!(!missing.is_transient());
    }

    #[test]
    fn test_not_found_and_mismatch_are_distinct() {
        let missing = Error::pool_not_found("a");
        let mismatch = Error::ServerGroupMismatch {
            pool: "a".into(),
            requested: "bogus".into(),
            actual: "daos_server".into(),
        };
        assert_ne!(missing.kind(), mismatch.kind());
        assert_ne!(missing.exit_code(), mismatch.exit_code());
        assert_ne!(missing.exit_code(), 0);
        assert_ne!(mismatch.exit_code(), 0);
    }

    #[test]
    fn test_remote_errors_keep_their_kind() {
        let remote = Error::Api {
            kind: "server_group_mismatch".into(),
            message: "wrong group".into(),
        };
        assert_eq!(remote.kind(), "server_group_mismatch");
        assert_eq!(remote.exit_code(), 5);
        assert!(!remote.is_retryable());

        let remote = Error::Api {
            kind: "timeout".into(),
            message: "probe timed out".into(),
        };
        assert!(remote.is_retryable());
        assert_eq!(remote.exit_code(), 9);

        let unknown = Error::Api {
            kind: "something_new".into(),
            message: "?".into(),
        };
        assert_eq!(unknown.kind(), "remote_error");
        assert_eq!(unknown.exit_code(), 1);
    }

    #[test]
    fn test_transient_matches_retryable() {
        let notice = Error::Notification {
            handle: "h".into(),
            reason: "mailbox closed".into(),
        };
        assert!(notice.is_transient());
        assert!(notice.is_retryable());

        let errors = [
            notice,
            Error::ServerGroupUnreachable { group: "g".into() },
            Error::Timeout {
                operation: "probe".into(),
                after: Duration::from_millis(1),
            },
            Error::pool_not_found("p"),
            Error::InvalidParameter("x".into()),
            Error::Configuration("x".into()),
            Error::Api {
                kind: "http_error".into(),
                message: "reset".into(),
            },
        ];
        for err in &errors {
            assert_eq!(err.is_transient(), err.is_retryable(), "{}", err.kind());
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::InvalidParameter("x".into()).exit_code(), 2);
        assert_eq!(Error::pool_not_found("p").exit_code(), 4);
        assert_eq!(Error::Configuration("x".into()).exit_code(), 78);
        assert_eq!(Error::Internal("x".into()).exit_code(), 1);
    }
}
