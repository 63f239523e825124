//! Error types for pool operations

use crate::classes::{CredentialClass, OperationClass};

/// Errors from pool construction and credential selection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("all credentials exhausted after trying {tried}")]
    AllCredentialsExhausted { tried: usize },

    #[error("insufficient credentials: {required} required, {found} configured")]
    InsufficientCredentials { required: usize, found: usize },

    #[error(
        "operation {operation} is mapped to the {class} credential but only {available} credential(s) are configured"
    )]
    UnresolvedClass {
        operation: OperationClass,
        class: CredentialClass,
        available: usize,
    },

    #[error("operation {0} has no credential class configured")]
    UnmappedOperation(OperationClass),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("invalid credential class: {0}")]
    InvalidClass(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
