//! Crate-wide error type.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure (connect, timeout, TLS, malformed URL).
    #[error("{0}")]
    Http(String),

    /// The hosted service answered with a non-success status.
    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    #[error("Session expired or missing, please log in again")]
    Unauthorized,

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A remote procedure ran but reported `success: false`.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Invalid status change: {0}")]
    InvalidTransition(String),

    #[error("{0}")]
    Validation(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Local database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credential store error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// True for failures where retrying later (or reading a cache) makes sense.
    pub fn is_offline(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_classification() {
        assert!(Error::Http("Cannot reach".into()).is_offline());
        assert!(Error::Api {
            status: 503,
            message: "down".into()
        }
        .is_offline());
        assert!(!Error::Api {
            status: 400,
            message: "bad".into()
        }
        .is_offline());
        assert!(!Error::Unauthorized.is_offline());
    }

    #[test]
    fn api_error_display_includes_status() {
        let err = Error::Api {
            status: 422,
            message: "invalid input".into(),
        };
        assert_eq!(err.to_string(), "invalid input (HTTP 422)");
    }
}
