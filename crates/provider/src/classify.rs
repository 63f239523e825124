//! Error classification for Gemini API responses
//!
//! Google surfaces per-key quota exhaustion as 429 / `RESOURCE_EXHAUSTED`;
//! those rotate to the next key. Gateway-level failures (408, 5xx, network
//! resets, timeouts) back off and retry. Everything else, including responses
//! that parse but fail validation, is fatal.

use crate::{Classifier, ErrorClassification, ProviderError};

/// Message fragments that indicate a per-key quota or rate limit.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "too many requests",
];

/// Message fragments that indicate a transient provider or network failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "network error",
    "timeout",
    "timed out",
    "temporarily unavailable",
    "internal server error",
    "internal error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "overloaded",
    "failed to generate",
];

/// Classify an error by its message text alone.
///
/// Rate-limit phrases win over transient phrases, so "quota exceeded, service
/// unavailable" rotates rather than backs off. Matching is case-insensitive.
pub fn classify_message(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClassification::RateLimited;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClassification::Transient;
    }
    ErrorClassification::Fatal
}

/// Classify an upstream error by HTTP status and response message.
///
/// 429 always rotates. 408/500/502/503/504 back off. 400 carrying a quota
/// message also rotates (Gemini reports some per-key limits that way); other
/// statuses fall back to message inspection.
pub fn classify_status(status: u16, message: &str) -> ErrorClassification {
    match status {
        429 => ErrorClassification::RateLimited,
        408 | 500 | 502 | 503 | 504 => ErrorClassification::Transient,
        401 | 403 | 404 => ErrorClassification::Fatal,
        _ => classify_message(message),
    }
}

/// Stock classifier for `ProviderError` values produced by the Gemini caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiClassifier;

impl Classifier<ProviderError> for GeminiClassifier {
    fn classify(&self, error: &ProviderError) -> ErrorClassification {
        match error {
            ProviderError::Status { status, message } => classify_status(*status, message),
            ProviderError::Network(_) | ProviderError::Timeout(_) => {
                ErrorClassification::Transient
            }
            ProviderError::InvalidResponse(_) => ErrorClassification::Fatal,
        }
    }
}
