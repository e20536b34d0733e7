//! Gateway error taxonomy.
//!
//! Every per-message failure is one of these variants; the dispatcher and the
//! webhook server decide retry, fallback or rejection from the variant alone.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Signature, secret or token mismatch. Rejected, never retried.
    #[error("auth: {0}")]
    Auth(String),

    /// Malformed platform payload. Logged, dropped and acknowledged.
    #[error("parse: {0}")]
    Parse(String),

    #[error("backend call timed out after {0:?}")]
    BackendTimeout(std::time::Duration),

    /// Network error or 5xx from the backend.
    #[error("backend transient: {0}")]
    BackendTransient(String),

    /// Backend rejected the request (4xx, bad response). Not retried.
    #[error("backend: {0}")]
    BackendFatal(String),

    #[error("delivery: {message}")]
    Delivery { message: String, transient: bool },

    #[error("intake queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("config: {0}")]
    Config(String),

    #[error("gateway is shutting down")]
    Shutdown,
}

impl GatewayError {
    /// Whether the failed operation may be attempted again after backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::BackendTimeout(_) | GatewayError::BackendTransient(_) => true,
            GatewayError::Delivery { transient, .. } => *transient,
            _ => false,
        }
    }

    pub fn delivery(message: impl Into<String>, transient: bool) -> Self {
        GatewayError::Delivery {
            message: message.into(),
            transient,
        }
    }

    /// Delivery error from a failed platform HTTP call: 5xx and 429 are transient.
    pub fn delivery_status(what: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let transient = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        GatewayError::delivery(format!("{} failed: {} {}", what, status, body), transient)
    }

    /// Delivery error from a reqwest transport failure (connect, timeout, body read).
    pub fn delivery_transport(what: &str, err: reqwest::Error) -> Self {
        GatewayError::delivery(format!("{}: {}", what, err), true)
    }
}
