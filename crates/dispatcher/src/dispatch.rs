//! Dispatcher: drives the state machine against a credential pool

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use key_pool::{Credential, CredentialPool, OperationClass};
use provider::{Classifier, ErrorClassification};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{DeadlineError, with_deadline};
use crate::machine::{DispatchAction, DispatchEvent, DispatchState, Limits, handle_event};
use crate::outcome::{AttemptError, Completed, Failure, Outcome};
use crate::policy::{KeySelection, RetryPolicy};

/// Reported to `DispatchOptions::on_retry` before every retry.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// The attempt that just failed.
    pub attempt: u32,
    /// Credential that attempt ran with.
    pub credential_index: usize,
    pub classification: ErrorClassification,
    /// Backoff about to be slept; `None` for an immediate rotation.
    pub delay: Option<Duration>,
    /// Display form of the failed attempt's error.
    pub message: String,
}

/// Hook invoked on each retry.
pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Per-call options.
#[derive(Clone, Default)]
pub struct DispatchOptions {
    pub selection: KeySelection,
    pub policy: RetryPolicy,
    /// Operation the call serves; labels the dispatch metrics when the
    /// selection alone does not name it.
    pub operation: Option<OperationClass>,
    /// Aborts the whole call, including any pending attempt or backoff.
    pub cancel: CancellationToken,
    pub on_retry: Option<RetryHook>,
}

impl DispatchOptions {
    pub fn new(selection: KeySelection, policy: RetryPolicy) -> Self {
        Self {
            selection,
            policy,
            ..Self::default()
        }
    }

    pub fn with_operation(mut self, operation: OperationClass) -> Self {
        self.operation = Some(operation);
        self
    }

    /// `operation` label of the dispatch metrics.
    pub fn metric_label(&self) -> String {
        match (self.operation, self.selection) {
            (Some(op), _) | (None, KeySelection::Operation(op)) => op.as_str().to_string(),
            (None, KeySelection::RoundRobin) => self.selection.to_string(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_on_retry(mut self, hook: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for DispatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchOptions")
            .field("selection", &self.selection)
            .field("policy", &self.policy)
            .field("operation", &self.operation)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Ephemeral state of one dispatched call.
struct RetryContext<E> {
    credential: Option<Credential>,
    last_error: Option<AttemptError<E>>,
    last_classification: Option<ErrorClassification>,
    partitioned: bool,
    started: Instant,
}

impl<E: fmt::Display> RetryContext<E> {
    fn last_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    fn credential_index(&self) -> usize {
        self.credential.as_ref().map(|c| c.index()).unwrap_or(0)
    }
}

/// Runs units of work against a shared credential pool with rotation and retry.
///
/// Cheap to clone; every clone shares the same pool, so rotation performed by
/// one call is visible to the next credential lookup of any other.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<CredentialPool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Execute `work` until it succeeds, fails fatally, or the budget runs out.
    ///
    /// `work` receives the credential for each attempt and must be callable
    /// repeatedly. Attempts are strictly sequential. Rate-limited failures
    /// rotate immediately; transient failures and timeouts back off
    /// exponentially; everything else returns at once.
    #[instrument(skip_all, fields(selection = %options.selection))]
    pub async fn dispatch<T, E, K, F, Fut>(
        &self,
        options: &DispatchOptions,
        classifier: &K,
        mut work: F,
    ) -> Outcome<T, E>
    where
        E: fmt::Display,
        K: Classifier<E> + ?Sized,
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = &options.policy;
        let selection = options.metric_label();
        let limits = Limits {
            max_retries: policy.attempts(),
            pool_size: self.pool.size(),
            rotate_on_transient: policy.rotate_on_transient,
        };
        let mut ctx: RetryContext<E> = RetryContext {
            credential: None,
            last_error: None,
            last_classification: None,
            partitioned: match options.selection {
                KeySelection::Operation(op) => self.pool.is_partitioned(op),
                KeySelection::RoundRobin => false,
            },
            started: Instant::now(),
        };

        let (mut state, mut action) = handle_event(DispatchState::Idle, DispatchEvent::Start, &limits);

        loop {
            let event = match action {
                DispatchAction::Attempt { attempt } => {
                    let credential = match ctx.credential.clone() {
                        Some(c) => c,
                        None => match self.initial_credential(options.selection) {
                            Ok(c) => c,
                            Err(e) => {
                                (state, action) = handle_event(
                                    state,
                                    DispatchEvent::PoolUnavailable(e.to_string()),
                                    &limits,
                                );
                                continue;
                            }
                        },
                    };
                    self.pool.record_use(&credential);
                    ctx.credential = Some(credential.clone());
                    debug!(
                        attempt,
                        max_attempts = limits.max_retries,
                        credential_index = credential.index(),
                        "dispatching attempt"
                    );

                    let timeout_message = format!(
                        "operation timed out after {}ms (attempt {attempt}/{})",
                        policy.timeout.as_millis(),
                        limits.max_retries
                    );
                    match with_deadline(
                        work(credential.clone()),
                        policy.timeout,
                        &timeout_message,
                        &options.cancel,
                    )
                    .await
                    {
                        Ok(value) => {
                            record_attempt(&selection, "success");
                            let (_, action) =
                                handle_event(state, DispatchEvent::AttemptSucceeded, &limits);
                            let attempts = match action {
                                DispatchAction::Complete { attempts } => attempts,
                                _ => attempt,
                            };
                            record_outcome(&selection, "success", ctx.started);
                            info!(
                                attempts,
                                credential_index = credential.index(),
                                "dispatch succeeded"
                            );
                            return Ok(Completed {
                                value,
                                attempts,
                                credential_index: credential.index(),
                            });
                        }
                        Err(DeadlineError::Failed(e)) => {
                            ctx.last_error = Some(AttemptError::Remote(e));
                            DispatchEvent::AttemptFailed
                        }
                        Err(DeadlineError::Timeout(msg)) => {
                            ctx.last_error = Some(AttemptError::Timeout(msg));
                            DispatchEvent::AttemptFailed
                        }
                        Err(DeadlineError::Cancelled) => {
                            record_attempt(&selection, "cancelled");
                            DispatchEvent::Cancelled
                        }
                    }
                }

                DispatchAction::Classify => {
                    let classification = match &ctx.last_error {
                        Some(AttemptError::Remote(e)) => classifier.classify(e),
                        Some(AttemptError::Timeout(_)) => ErrorClassification::Transient,
                        None => ErrorClassification::Fatal,
                    };
                    ctx.last_classification = Some(classification);
                    record_attempt(&selection, classification.label());
                    debug!(
                        attempt = state.attempt(),
                        classification = classification.label(),
                        error = %ctx.last_message(),
                        "attempt failed"
                    );
                    DispatchEvent::Classified(classification)
                }

                DispatchAction::Backoff { attempt } => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        credential_index = ctx.credential_index(),
                        error = %ctx.last_message(),
                        "transient failure, backing off"
                    );
                    self.notify(options, &ctx, attempt, ErrorClassification::Transient, Some(delay));
                    tokio::select! {
                        biased;
                        _ = options.cancel.cancelled() => DispatchEvent::Cancelled,
                        _ = tokio::time::sleep(delay) => DispatchEvent::BackoffElapsed,
                    }
                }

                DispatchAction::Rotate => {
                    let rotated = match (&ctx.credential, ctx.partitioned) {
                        (Some(current), true) => self.pool.rotate_from(current),
                        _ => self.pool.rotate_on_error(),
                    };
                    match rotated {
                        Ok(next) => {
                            if ctx.last_classification == Some(ErrorClassification::RateLimited) {
                                warn!(
                                    attempt = state.attempt(),
                                    from = ctx.credential_index(),
                                    to = next.index(),
                                    error = %ctx.last_message(),
                                    "rate limited, rotating credential"
                                );
                                self.notify(
                                    options,
                                    &ctx,
                                    state.attempt(),
                                    ErrorClassification::RateLimited,
                                    None,
                                );
                            } else {
                                debug!(
                                    from = ctx.credential_index(),
                                    to = next.index(),
                                    "rotating credential after backoff"
                                );
                            }
                            ctx.credential = Some(next);
                            DispatchEvent::Rotated
                        }
                        Err(e) => {
                            debug!(error = %e, "rotation exhausted");
                            DispatchEvent::RotationExhausted
                        }
                    }
                }

                DispatchAction::Fail { attempts, kind } => {
                    let failure = Failure {
                        kind,
                        attempts,
                        last_error: ctx.last_error.take(),
                    };
                    record_outcome(&selection, failure.kind.label(), ctx.started);
                    warn!(
                        attempts,
                        kind = failure.kind.label(),
                        error = %failure,
                        "dispatch failed"
                    );
                    return Err(failure);
                }

                DispatchAction::Complete { .. } | DispatchAction::None => {
                    // Success returns from the attempt arm; reaching here means the
                    // machine rejected an event, which is a dispatcher bug.
                    let attempts = state.attempt();
                    let failure = Failure {
                        kind: crate::outcome::FailureKind::NonRetryable,
                        attempts,
                        last_error: ctx.last_error.take(),
                    };
                    record_outcome(&selection, failure.kind.label(), ctx.started);
                    warn!(?state, "dispatch state machine stalled");
                    return Err(failure);
                }
            };

            (state, action) = handle_event(state, event, &limits);
        }
    }

    /// First credential of a call.
    fn initial_credential(&self, selection: KeySelection) -> key_pool::Result<Credential> {
        match selection {
            KeySelection::Operation(op) if self.pool.is_partitioned(op) => {
                self.pool.credential_for_operation(op)
            }
            _ => self.pool.current_credential(),
        }
    }

    fn notify<E: fmt::Display>(
        &self,
        options: &DispatchOptions,
        ctx: &RetryContext<E>,
        attempt: u32,
        classification: ErrorClassification,
        delay: Option<Duration>,
    ) {
        if let Some(hook) = &options.on_retry {
            hook(&RetryEvent {
                attempt,
                credential_index: ctx.credential_index(),
                classification,
                delay,
                message: ctx.last_message(),
            });
        }
    }
}

fn record_attempt(selection: &str, result: &'static str) {
    metrics::counter!(
        "dispatch_attempts_total",
        "operation" => selection.to_string(),
        "result" => result
    )
    .increment(1);
}

fn record_outcome(selection: &str, outcome: &'static str, started: Instant) {
    metrics::counter!(
        "dispatch_outcomes_total",
        "operation" => selection.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("dispatch_duration_seconds", "outcome" => outcome)
        .record(started.elapsed().as_secs_f64());
}
