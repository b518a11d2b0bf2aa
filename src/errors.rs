//! # Error Taxonomy
//!
//! Every fallible operation in the engine returns [`AppResult`]. Per-part and
//! per-item failures are captured by the coordinator and the orchestrator and
//! reported structurally; only whole-operation failures reach the caller as
//! an `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bad, missing or expired identity or admin credential. Never retried.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authority or storage endpoint unreachable. Safe to retry with backoff.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Malformed request or upstream rejection unrelated to credentials.
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Upload of part {part_number} failed: {cause}")]
    PartUploadFailed {
        part_number: u32,
        #[source]
        cause: Box<AppError>,
    },

    #[error("Upload of part {part_number} gave up after {attempts} attempts: {cause}")]
    RetriesExhausted {
        part_number: u32,
        attempts: u32,
        #[source]
        cause: Box<AppError>,
    },

    #[error("Completion failed: {0}")]
    CompletionFailed(String),

    #[error("Abort failed: {0}")]
    AbortFailed(String),

    #[error("Batch item {path} failed: {cause}")]
    BatchItemFailed { path: String, cause: String },

    #[error("Grant expired at {expires_at}")]
    GrantExpired { expires_at: chrono::DateTime<chrono::Utc> },

    #[error("Cannot {action} an upload in state {state}")]
    InvalidState { state: String, action: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Returns true for transient failures that a bounded retry may clear.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Unavailable(_) | AppError::Timeout(_) | AppError::GrantExpired { .. } => true,
            AppError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Maps a non-success HTTP status from the broker or storage endpoint.
    pub fn from_status(status: http::StatusCode, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body.trim())
        };

        match status.as_u16() {
            401 | 403 => AppError::Unauthorized(message),
            408 | 429 => AppError::Unavailable(message),
            s if s >= 500 => AppError::Unavailable(message),
            _ => AppError::Broker(message),
        }
    }

    /// Wraps a failure of one part transfer.
    pub fn part_failed(part_number: u32, cause: AppError) -> Self {
        AppError::PartUploadFailed {
            part_number,
            cause: Box::new(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn credential_statuses_map_to_unauthorized() {
        assert!(matches!(
            AppError::from_status(StatusCode::UNAUTHORIZED, ""),
            AppError::Unauthorized(_)
        ));
        assert!(matches!(
            AppError::from_status(StatusCode::FORBIDDEN, "bad password"),
            AppError::Unauthorized(_)
        ));
    }

    #[test]
    fn server_and_throttle_statuses_are_retryable() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(AppError::from_status(status, "").is_retryable());
        }
    }

    #[test]
    fn client_errors_are_broker_errors() {
        let err = AppError::from_status(StatusCode::NOT_FOUND, "{\"error\":\"no such key\"}");
        assert!(matches!(err, AppError::Broker(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("no such key"));
    }

    #[test]
    fn part_failure_keeps_its_cause() {
        let err = AppError::part_failed(3, AppError::Unauthorized("expired".into()));
        assert_eq!(
            err.to_string(),
            "Upload of part 3 failed: Unauthorized: expired"
        );
        assert!(!err.is_retryable());
    }
}
