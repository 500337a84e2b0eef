//! Error types for usenet-fs
//!
//! The fetch path classifies every failure into one of the taxonomy variants
//! below; callers pattern-match on the variant to decide between failover,
//! retry, deferral, and permanent failure.

use thiserror::Error;

/// Result type alias for usenet-fs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-fs
///
/// The first group of variants is the article/job taxonomy; the second group
/// wraps infrastructure failures (database, I/O, malformed input).
#[derive(Debug, Error)]
pub enum Error {
    /// Article does not exist on any consulted server, or a store entity
    /// lookup came up empty
    #[error("not found: {0}")]
    NotFound(String),

    /// Server rejected credentials mid-session (480/481/482), or a download
    /// key failed verification
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transient failure (timeout, reset, server busy) — retryable upstream
    #[error("transient error: {0}")]
    Transient(String),

    /// Protocol-level failure (malformed yEnc, unexpected response code)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unrecoverable server condition (authentication rejected by config);
    /// the server is disabled until reconfigured
    #[error("fatal server error: {0}")]
    Fatal(String),

    /// Operation was cancelled; never reported as a failure
    #[error("operation cancelled")]
    Cancelled,

    /// Input failed validation (bad NZB structure, unsupported archive,
    /// missing importable video)
    #[error("validation error: {0}")]
    Validation(String),

    /// Conflicting state (duplicate job name with mark-failed policy, name
    /// collision the store cannot resolve)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "servers")
        key: Option<String>,
    },

    /// SQLx database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid NZB file
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,
}

impl Error {
    /// Single-line, sanitized message suitable for a history row
    ///
    /// Control characters and newlines are collapsed so the message renders
    /// as one line in user-facing views.
    pub fn fail_message(&self) -> String {
        let raw = self.to_string();
        let mut out = String::with_capacity(raw.len());
        let mut last_was_space = false;
        for c in raw.chars() {
            if c.is_control() || c == '\n' || c == '\r' {
                if !last_was_space {
                    out.push(' ');
                    last_was_space = true;
                }
            } else {
                out.push(c);
                last_was_space = c == ' ';
            }
        }
        out.trim().to_string()
    }
}

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset)
/// should return `true`. Permanent failures (bad credentials, malformed
/// input) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            // SQLite lock contention resolves on its own
            Error::Database(sqlx::Error::Database(db)) => {
                db.message().contains("locked") || db.message().contains("busy")
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(Error::Transient("timeout".into()).is_retryable());
    }

    #[test]
    fn taxonomy_variants_are_not_retryable() {
        for err in [
            Error::NotFound("m".into()),
            Error::Unauthorized("u".into()),
            Error::Protocol("p".into()),
            Error::Fatal("f".into()),
            Error::Cancelled,
            Error::Validation("v".into()),
            Error::Conflict("c".into()),
        ] {
            assert!(!err.is_retryable(), "{err} must not be retryable");
        }
    }

    #[test]
    fn io_timeout_is_retryable() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t"));
        assert!(err.is_retryable());
    }

    #[test]
    fn fail_message_is_single_line() {
        let err = Error::Validation("line one\nline two\r\n  line three".into());
        let msg = err.fail_message();
        assert!(!msg.contains('\n'), "newlines must be collapsed: {msg:?}");
        assert!(!msg.contains('\r'));
        assert!(msg.contains("line one"));
        assert!(msg.contains("line three"));
    }
}
