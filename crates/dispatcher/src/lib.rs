//! Multi-key request dispatcher
//!
//! Runs a caller-supplied unit of work against a remote provider, handing it
//! one credential per attempt from a shared `CredentialPool`. Failed attempts
//! are classified through a pluggable `Classifier`:
//! - rate limited → rotate to the next credential, retry immediately
//! - transient (including attempt timeouts) → exponential backoff, retry
//! - fatal → stop
//!
//! The retry loop is a pure state machine (`machine::handle_event`) driven by
//! `Dispatcher::dispatch`, which performs the I/O each action asks for.

pub mod backoff;
pub mod dispatch;
pub mod machine;
pub mod outcome;
pub mod policy;

pub use backoff::{DeadlineError, compute_delay, with_deadline, with_jitter};
pub use dispatch::{DispatchOptions, Dispatcher, RetryEvent};
pub use outcome::{AttemptError, Completed, Failure, FailureKind, Outcome};
pub use policy::{KeySelection, RetryPolicy};
