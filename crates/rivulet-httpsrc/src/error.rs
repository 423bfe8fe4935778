//! Source Error Types
//!
//! This module defines the error surface of the HTTP source element. Every
//! failure reaches the consumer through the return value of the pull loop;
//! the scheduler worker never propagates errors to its owner, it records the
//! outcome in the affected request slot instead.

/// Errors surfaced by the HTTP source element.
///
/// The variants map onto the failure classes of the element: configuration
/// problems caught before a transfer starts, transport-level failures,
/// HTTP error statuses, timeouts, and internal scheduler faults.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Invalid or missing configuration (URI, range, http-version, option range)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Socket, TLS, DNS or protocol failure below the HTTP layer.
    ///
    /// Recoverable iff no body bytes were delivered and retries remain.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// HTTP response with status >= 400, or a redirect that could not be
    /// followed. Never retried.
    #[error("HTTP error {status}: {reason}")]
    Http {
        status: u16,
        reason: String,
        redirect_uri: Option<String>,
    },

    /// The transfer exceeded the configured total timeout without completing.
    ///
    /// Retryable under the zero-bytes rule.
    #[error("Transfer timed out after {elapsed_s:.1}s (limit {limit_s}s)")]
    Timeout { elapsed_s: f64, limit_s: u32 },

    /// A concurrent unlock cancelled the operation.
    #[error("Flushing in progress")]
    Flushing,

    /// Scheduler refused the request or the transport handle could not be
    /// built after options were applied. Fatal.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SourceError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an HTTP status error with the optional redirect target
    pub fn http(status: u16, reason: impl Into<String>, redirect_uri: Option<String>) -> Self {
        Self::Http {
            status,
            reason: reason.into(),
            redirect_uri,
        }
    }

    /// Create a timeout error
    pub fn timeout(elapsed_s: f64, limit_s: u32) -> Self {
        Self::Timeout { elapsed_s, limit_s }
    }

    /// Create an internal scheduler/handle error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this failure class may be retried when no body bytes have
    /// been surfaced yet. HTTP statuses and internal faults never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Result alias used throughout the crate
pub type SourceResult<T> = Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SourceError::config("no URI set");
        assert_eq!(err.to_string(), "Configuration error: no URI set");

        let err = SourceError::http(404, "Not Found", None);
        assert_eq!(err.to_string(), "HTTP error 404: Not Found");

        let err = SourceError::timeout(12.5, 10);
        assert_eq!(err.to_string(), "Transfer timed out after 12.5s (limit 10s)");
    }

    #[test]
    fn test_retryability() {
        assert!(SourceError::transport("connection reset").is_retryable());
        assert!(SourceError::timeout(30.0, 10).is_retryable());
        assert!(!SourceError::http(500, "Internal Server Error", None).is_retryable());
        assert!(!SourceError::config("bad range").is_retryable());
        assert!(!SourceError::internal("duplicate enqueue").is_retryable());
        assert!(!SourceError::Flushing.is_retryable());
    }

    #[test]
    fn test_http_error_carries_redirect() {
        let err = SourceError::http(301, "Moved Permanently", Some("http://b.test/".into()));
        match err {
            SourceError::Http {
                status,
                redirect_uri,
                ..
            } => {
                assert_eq!(status, 301);
                assert_eq!(redirect_uri.as_deref(), Some("http://b.test/"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_error_traits() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SourceError>();
    }
}
