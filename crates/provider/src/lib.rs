//! Provider error shapes and the classification seam
//!
//! Defines the typed error a unit of work raises against the remote AI
//! provider, and the `Classifier` trait that maps such errors onto a retry
//! strategy. The dispatcher only ever sees an `ErrorClassification`; all
//! provider-specific status and message inspection lives behind this seam.

pub mod classify;

pub use classify::{GeminiClassifier, classify_message, classify_status};

use serde::Serialize;

/// Classification of a failed attempt to determine retry/rotation strategy.
///
/// - RateLimited rotates to the next credential without backoff
/// - Transient waits out an exponential backoff and retries
/// - Fatal stops immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Per-key quota or rate limit (429, RESOURCE_EXHAUSTED)
    RateLimited,
    /// Timeouts, network failures, 5xx
    Transient,
    /// Validation failures, bad requests, invalid keys
    Fatal,
}

impl ErrorClassification {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::Transient => "transient",
            ErrorClassification::Fatal => "fatal",
        }
    }

    /// Whether any retry (rotation or backoff) is allowed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClassification::Fatal)
    }
}

/// Pluggable error classifier.
///
/// Implemented for any `Fn(&E) -> ErrorClassification`, so tests and callers
/// with their own error shapes can pass a closure.
pub trait Classifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorClassification;
}

impl<E, F> Classifier<E> for F
where
    F: Fn(&E) -> ErrorClassification + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClassification {
        self(error)
    }
}

/// Error raised by an operation caller talking to the remote provider.
///
/// Exposes an inspectable status code (when the provider answered) so the
/// classifier can tell quota, transient and fatal failures apart.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// HTTP status returned by the provider, if the request got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Build a `Status` error from a raw response body.
    ///
    /// Google APIs wrap failures as `{"error":{"code":..,"message":..,"status":..}}`;
    /// the message (suffixed with the status string when present) is extracted,
    /// otherwise the raw body is kept.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                let err = v.get("error")?;
                let msg = err.get("message")?.as_str()?.to_string();
                Some(match err.get("status").and_then(|s| s.as_str()) {
                    Some(code) => format!("{msg} ({code})"),
                    None => msg,
                })
            })
            .unwrap_or_else(|| body.trim().to_string());
        ProviderError::Status { status, message }
    }
}
