//! Per-request gateway errors and their HTTP mapping

use axum::http::StatusCode;
use dispatcher::{Failure, FailureKind};
use provider::ProviderError;
use thiserror::Error;

/// Why a gateway request did not produce an upstream result.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Dispatch(#[from] Failure<ProviderError>),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::UnknownOperation(_) => StatusCode::NOT_FOUND,
            Error::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Error::Dispatch(failure) => dispatch_status(failure),
        }
    }

    /// Value of the `error.type` field in JSON error bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::UnknownOperation(_) => "not_found",
            Error::InvalidBody(_) => "invalid_request",
            Error::Dispatch(failure) => failure.kind.label(),
        }
    }

    /// Attempts spent before giving up; zero when nothing was dispatched.
    pub fn attempts(&self) -> u32 {
        match self {
            Error::Dispatch(failure) => failure.attempts,
            _ => 0,
        }
    }
}

fn dispatch_status(failure: &Failure<ProviderError>) -> StatusCode {
    match &failure.kind {
        FailureKind::AllCredentialsExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
        FailureKind::Cancelled | FailureKind::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ if failure.is_timeout()
            || matches!(failure.remote_error(), Some(ProviderError::Timeout(_))) =>
        {
            StatusCode::GATEWAY_TIMEOUT
        }
        FailureKind::NonRetryable => match failure.remote_error().and_then(|e| e.status()) {
            Some(status @ 400..=499) => {
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::BAD_GATEWAY,
        },
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Result alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;
