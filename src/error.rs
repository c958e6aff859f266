//! Service error taxonomy
//!
//! Every failure a request can hit maps to one variant here, and every
//! variant maps to exactly one HTTP status. Plumbing code below the request
//! layer uses `anyhow::Result` and is converted at the handler boundary.

use hyper::StatusCode;

/// Errors surfaced to clients
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Malformed, oversized or out-of-range input
    #[error("{0}")]
    Validation(String),

    /// Missing/invalid credential, referer mismatch or blacklisted origin
    #[error("{0}")]
    Authorization(String),

    /// Service is in maintenance mode
    #[error("Service is under maintenance")]
    Maintenance,

    /// Window budget exceeded
    #[error("Too many requests, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Durable sink or export sink I/O failure
    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        ServiceError::Authorization(message.into())
    }

    /// HTTP status for this error.
    ///
    /// Validation failures answer 403, same as the ingestion API has always
    /// returned for bad parameters.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::FORBIDDEN,
            ServiceError::Authorization(_) => StatusCode::FORBIDDEN,
            ServiceError::Maintenance => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Sink(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to send to clients. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Sink(_) | ServiceError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Internal(format!("{:#}", err))
    }
}
