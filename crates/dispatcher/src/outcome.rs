//! Dispatch results

use std::fmt;

/// Why a dispatch gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The pool could not hand out a credential at all.
    PoolExhausted(String),
    /// Every credential in the ring answered with a rate-limit error.
    AllCredentialsExhausted { tried: usize },
    /// A retryable error persisted through the whole attempt budget.
    RetriesExhausted,
    /// The classifier marked the error fatal.
    NonRetryable,
    /// The caller's cancellation token fired.
    Cancelled,
}

impl FailureKind {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::PoolExhausted(_) => "pool_exhausted",
            FailureKind::AllCredentialsExhausted { .. } => "all_credentials_exhausted",
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::NonRetryable => "non_retryable",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// The error observed on a single attempt.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// The unit of work returned an error.
    Remote(E),
    /// The attempt deadline fired; carries the timeout message.
    Timeout(String),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Remote(e) => write!(f, "{e}"),
            AttemptError::Timeout(msg) => f.write_str(msg),
        }
    }
}

/// Successful dispatch.
#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Ring index of the credential that succeeded.
    pub credential_index: usize,
}

/// Failed dispatch: what went wrong, after how many attempts, and the last
/// underlying error (absent only when no attempt ran).
#[derive(Debug)]
pub struct Failure<E> {
    pub kind: FailureKind,
    pub attempts: u32,
    pub last_error: Option<AttemptError<E>>,
}

impl<E> Failure<E> {
    /// Whether the final attempt ended on its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.last_error, Some(AttemptError::Timeout(_)))
    }

    /// The last error returned by the unit of work, if any.
    pub fn remote_error(&self) -> Option<&E> {
        match &self.last_error {
            Some(AttemptError::Remote(e)) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attempts = self.attempts;
        match (&self.kind, &self.last_error) {
            (FailureKind::PoolExhausted(msg), _) => write!(f, "no credential available: {msg}"),
            (FailureKind::Cancelled, _) => {
                write!(f, "operation cancelled after {attempts} attempt(s)")
            }
            (FailureKind::AllCredentialsExhausted { tried }, Some(last)) => write!(
                f,
                "all {tried} credential(s) rate limited after {attempts} attempt(s): {last}"
            ),
            (FailureKind::AllCredentialsExhausted { tried }, None) => write!(
                f,
                "all {tried} credential(s) rate limited after {attempts} attempt(s)"
            ),
            (_, Some(last)) => write!(f, "operation failed after {attempts} attempt(s): {last}"),
            (_, None) => write!(f, "operation failed after {attempts} attempt(s)"),
        }
    }
}

impl<E> std::error::Error for Failure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.remote_error().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result of `Dispatcher::dispatch`.
pub type Outcome<T, E> = Result<Completed<T>, Failure<E>>;
