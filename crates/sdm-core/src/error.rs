//! Engine error kinds.
//!
//! `Paused` and `Cancelled` are control-flow outcomes, not failures; callers
//! must never surface them as error events.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// DNS, TCP, TLS, or malformed HTTP below the status-code level.
    #[error("transport: {0}")]
    Transport(String),

    /// Server answered with a >= 400 status.
    #[error("HTTP {0}")]
    ProtocolStatus(u32),

    /// Server refused or silently ignored a Range request.
    #[error("server does not support byte ranges")]
    RangeUnsupported,

    /// Server returned a different byte range than requested. Fatal without retry.
    #[error("range mismatch: requested {requested}, got {got}")]
    ByteMismatch { requested: String, got: String },

    /// File or database I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Context cancelled (delete, shutdown). Not a failure.
    #[error("cancelled")]
    Cancelled,

    /// User-initiated pause. Not a failure; remaining tasks stay persisted.
    #[error("paused")]
    Paused,

    /// Transient failures exceeded the per-task retry budget.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// No download with the given id.
    #[error("download not found")]
    NotFound,

    /// Resume was requested for a download that already completed.
    #[error("download already completed")]
    AlreadyCompleted,

    /// Offset out of range, unsupported URL scheme, or similar caller error.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A store operation was attempted before the database was configured.
    /// Callers must not collapse this into `NotFound`.
    #[error("database not configured")]
    DatabaseNotConfigured,
}

impl DownloadError {
    /// True for the two non-failure outcomes that end a transfer.
    pub fn is_stop(&self) -> bool {
        matches!(self, DownloadError::Paused | DownloadError::Cancelled)
    }
}

impl From<anyhow::Error> for DownloadError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<std::io::Error>() {
            Ok(io) => DownloadError::Io(io),
            Err(e) => DownloadError::Io(std::io::Error::other(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_cancel_are_stops() {
        assert!(DownloadError::Paused.is_stop());
        assert!(DownloadError::Cancelled.is_stop());
        assert!(!DownloadError::RangeUnsupported.is_stop());
        assert!(!DownloadError::ProtocolStatus(503).is_stop());
    }

    #[test]
    fn display_is_terse() {
        let e = DownloadError::ByteMismatch {
            requested: "offset 0".into(),
            got: "offset 100".into(),
        };
        assert!(e.to_string().contains("offset 0"));
        assert_eq!(DownloadError::NotFound.to_string(), "download not found");
        assert_eq!(
            DownloadError::DatabaseNotConfigured.to_string(),
            "database not configured"
        );
    }

    #[test]
    fn io_and_anyhow_conversions() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(DownloadError::from(io), DownloadError::Io(_)));

        let wrapped: DownloadError = anyhow::anyhow!("disk fell off").into();
        assert!(matches!(wrapped, DownloadError::Io(_)));
        assert!(wrapped.to_string().contains("disk fell off"));
    }

    #[test]
    fn retry_exhaustion_carries_detail() {
        let e = DownloadError::RetriesExhausted {
            attempts: 6,
            last: "HTTP 503".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains('6'));
        assert!(msg.contains("HTTP 503"));
    }
}
