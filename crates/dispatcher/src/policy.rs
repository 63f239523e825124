//! Retry policy and credential selection mode

use std::fmt;
use std::time::Duration;

use key_pool::OperationClass;

use crate::backoff::{compute_delay, with_jitter};

/// Per-call retry budget and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Values below 1 act as 1.
    pub max_retries: u32,
    /// Backoff base; attempt `k` waits `initial_delay * 2^(k-1)`.
    pub initial_delay: Duration,
    /// Deadline for each individual attempt.
    pub timeout: Duration,
    /// Add up to 10% random jitter to each backoff.
    pub jitter: bool,
    /// After a transient failure, move to the next credential as well as backing off.
    pub rotate_on_transient: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(30_000),
            jitter: false,
            rotate_on_transient: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_rotate_on_transient(mut self, rotate: bool) -> Self {
        self.rotate_on_transient = rotate;
        self
    }

    /// Effective attempt budget.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Backoff to wait after the given failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = compute_delay(attempt, self.initial_delay);
        if self.jitter { with_jitter(delay) } else { delay }
    }
}

/// How the first credential of a call is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeySelection {
    /// Shared pool cursor; rotation advances it for every caller.
    #[default]
    RoundRobin,
    /// The operation's designated credential; rotation walks the ring from
    /// there without moving the shared cursor. Unmapped operations fall back
    /// to the cursor.
    Operation(OperationClass),
}

impl fmt::Display for KeySelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySelection::RoundRobin => f.write_str("round_robin"),
            KeySelection::Operation(op) => f.write_str(op.as_str()),
        }
    }
}
