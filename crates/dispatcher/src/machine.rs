//! Dispatch state machine
//!
//! Pure state machine: receives events, returns (new_state, action). The
//! dispatcher executes the I/O each action implies (run an attempt, classify
//! the error, sleep, rotate) and feeds the result back as the next event.
//!
//! ```text
//! Idle → Attempting → Success
//!                   → EvaluatingFailure → Retrying → Attempting
//!                                       → RotatingCredential → Attempting
//!                                       → Fatal
//! ```

use provider::ErrorClassification;

use crate::outcome::FailureKind;

/// Bounds the machine needs to decide between retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Total attempts allowed (already clamped to at least 1).
    pub max_retries: u32,
    /// Credentials in the ring; caps rate-limit rotations.
    pub pool_size: usize,
    /// Rotate after a transient failure's backoff as well.
    pub rotate_on_transient: bool,
}

/// Per-call states.
///
/// `rate_limited` counts attempts in this call that hit a rate limit; once it
/// reaches the ring size every credential has been tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Attempting { attempt: u32, rate_limited: usize },
    EvaluatingFailure { attempt: u32, rate_limited: usize },
    Retrying { attempt: u32, rate_limited: usize },
    RotatingCredential { attempt: u32, rate_limited: usize },
    Success { attempts: u32 },
    Fatal { attempts: u32, kind: FailureKind },
}

impl DispatchState {
    /// Attempt number the state refers to (0 before the first attempt).
    pub fn attempt(&self) -> u32 {
        match self {
            DispatchState::Idle => 0,
            DispatchState::Attempting { attempt, .. }
            | DispatchState::EvaluatingFailure { attempt, .. }
            | DispatchState::Retrying { attempt, .. }
            | DispatchState::RotatingCredential { attempt, .. } => *attempt,
            DispatchState::Success { attempts } | DispatchState::Fatal { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchState::Success { .. } | DispatchState::Fatal { .. }
        )
    }
}

/// Events that drive state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Dispatch requested
    Start,
    /// Unit of work returned a value
    AttemptSucceeded,
    /// Unit of work returned an error or hit its deadline
    AttemptFailed,
    /// Classifier verdict on the last error
    Classified(ErrorClassification),
    /// Backoff sleep finished
    BackoffElapsed,
    /// Pool handed out the next credential
    Rotated,
    /// Pool reported no other credential to rotate to
    RotationExhausted,
    /// Pool could not supply a credential
    PoolUnavailable(String),
    /// Caller cancelled the dispatch
    Cancelled,
}

/// Actions the dispatcher should execute after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAction {
    /// Run the unit of work as the given attempt
    Attempt { attempt: u32 },
    /// Classify the error from the last attempt
    Classify,
    /// Sleep the policy's backoff for the given failed attempt
    Backoff { attempt: u32 },
    /// Move to the next credential
    Rotate,
    /// Return the value
    Complete { attempts: u32 },
    /// Return a failure
    Fail { attempts: u32, kind: FailureKind },
    /// No-op
    None,
}

fn fatal(attempts: u32, kind: FailureKind) -> (DispatchState, DispatchAction) {
    (
        DispatchState::Fatal {
            attempts,
            kind: kind.clone(),
        },
        DispatchAction::Fail { attempts, kind },
    )
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: DispatchState,
    event: DispatchEvent,
    limits: &Limits,
) -> (DispatchState, DispatchAction) {
    match (state, event) {
        // --- Idle ---
        (DispatchState::Idle, DispatchEvent::Start) => (
            DispatchState::Attempting {
                attempt: 1,
                rate_limited: 0,
            },
            DispatchAction::Attempt { attempt: 1 },
        ),

        // --- Attempting ---
        (DispatchState::Attempting { attempt, .. }, DispatchEvent::AttemptSucceeded) => (
            DispatchState::Success { attempts: attempt },
            DispatchAction::Complete { attempts: attempt },
        ),

        (
            DispatchState::Attempting {
                attempt,
                rate_limited,
            },
            DispatchEvent::AttemptFailed,
        ) => (
            DispatchState::EvaluatingFailure {
                attempt,
                rate_limited,
            },
            DispatchAction::Classify,
        ),

        // --- EvaluatingFailure ---
        (
            DispatchState::EvaluatingFailure { attempt, .. },
            DispatchEvent::Classified(ErrorClassification::Fatal),
        ) => fatal(attempt, FailureKind::NonRetryable),

        (
            DispatchState::EvaluatingFailure {
                attempt,
                rate_limited,
            },
            DispatchEvent::Classified(ErrorClassification::RateLimited),
        ) => {
            let tried = rate_limited + 1;
            if tried >= limits.pool_size {
                fatal(attempt, FailureKind::AllCredentialsExhausted { tried })
            } else if attempt >= limits.max_retries {
                fatal(attempt, FailureKind::RetriesExhausted)
            } else {
                (
                    DispatchState::RotatingCredential {
                        attempt,
                        rate_limited: tried,
                    },
                    DispatchAction::Rotate,
                )
            }
        }

        (
            DispatchState::EvaluatingFailure {
                attempt,
                rate_limited,
            },
            DispatchEvent::Classified(ErrorClassification::Transient),
        ) => {
            if attempt >= limits.max_retries {
                fatal(attempt, FailureKind::RetriesExhausted)
            } else {
                (
                    DispatchState::Retrying {
                        attempt,
                        rate_limited,
                    },
                    DispatchAction::Backoff { attempt },
                )
            }
        }

        // --- Retrying ---
        (
            DispatchState::Retrying {
                attempt,
                rate_limited,
            },
            DispatchEvent::BackoffElapsed,
        ) => {
            if limits.rotate_on_transient && limits.pool_size > 1 {
                (
                    DispatchState::RotatingCredential {
                        attempt,
                        rate_limited,
                    },
                    DispatchAction::Rotate,
                )
            } else {
                (
                    DispatchState::Attempting {
                        attempt: attempt + 1,
                        rate_limited,
                    },
                    DispatchAction::Attempt {
                        attempt: attempt + 1,
                    },
                )
            }
        }

        // --- RotatingCredential ---
        (
            DispatchState::RotatingCredential {
                attempt,
                rate_limited,
            },
            DispatchEvent::Rotated,
        ) => (
            DispatchState::Attempting {
                attempt: attempt + 1,
                rate_limited,
            },
            DispatchAction::Attempt {
                attempt: attempt + 1,
            },
        ),

        (
            DispatchState::RotatingCredential {
                attempt,
                rate_limited,
            },
            DispatchEvent::RotationExhausted,
        ) => fatal(
            attempt,
            FailureKind::AllCredentialsExhausted {
                tried: rate_limited.max(1),
            },
        ),

        // --- Any non-terminal state + cancel / no credential = stop ---
        (state, DispatchEvent::Cancelled) if !state.is_terminal() => {
            fatal(state.attempt(), FailureKind::Cancelled)
        }

        (state, DispatchEvent::PoolUnavailable(msg)) if !state.is_terminal() => {
            fatal(state.attempt(), FailureKind::PoolExhausted(msg))
        }

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, DispatchAction::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_retries: u32, pool_size: usize) -> Limits {
        Limits {
            max_retries,
            pool_size,
            rotate_on_transient: false,
        }
    }

    fn evaluating(attempt: u32, rate_limited: usize) -> DispatchState {
        DispatchState::EvaluatingFailure {
            attempt,
            rate_limited,
        }
    }

    #[test]
    fn start_attempts_first() {
        let (state, action) = handle_event(DispatchState::Idle, DispatchEvent::Start, &limits(3, 2));
        assert_eq!(
            state,
            DispatchState::Attempting {
                attempt: 1,
                rate_limited: 0
            }
        );
        assert_eq!(action, DispatchAction::Attempt { attempt: 1 });
    }

    #[test]
    fn success_completes_with_attempt_count() {
        let (state, action) = handle_event(
            DispatchState::Attempting {
                attempt: 2,
                rate_limited: 0,
            },
            DispatchEvent::AttemptSucceeded,
            &limits(3, 2),
        );
        assert_eq!(state, DispatchState::Success { attempts: 2 });
        assert_eq!(action, DispatchAction::Complete { attempts: 2 });
    }

    #[test]
    fn failure_goes_to_evaluation() {
        let (state, action) = handle_event(
            DispatchState::Attempting {
                attempt: 1,
                rate_limited: 0,
            },
            DispatchEvent::AttemptFailed,
            &limits(3, 2),
        );
        assert_eq!(state, evaluating(1, 0));
        assert_eq!(action, DispatchAction::Classify);
    }

    #[test]
    fn fatal_classification_stops_immediately() {
        let (state, action) = handle_event(
            evaluating(1, 0),
            DispatchEvent::Classified(ErrorClassification::Fatal),
            &limits(3, 2),
        );
        assert!(matches!(
            state,
            DispatchState::Fatal {
                attempts: 1,
                kind: FailureKind::NonRetryable
            }
        ));
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 1,
                kind: FailureKind::NonRetryable
            }
        );
    }

    #[test]
    fn rate_limit_rotates_without_backoff() {
        let (state, action) = handle_event(
            evaluating(1, 0),
            DispatchEvent::Classified(ErrorClassification::RateLimited),
            &limits(3, 3),
        );
        assert_eq!(
            state,
            DispatchState::RotatingCredential {
                attempt: 1,
                rate_limited: 1
            }
        );
        assert_eq!(action, DispatchAction::Rotate);
    }

    #[test]
    fn rate_limit_on_single_credential_exhausts() {
        let (_, action) = handle_event(
            evaluating(1, 0),
            DispatchEvent::Classified(ErrorClassification::RateLimited),
            &limits(3, 1),
        );
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 1,
                kind: FailureKind::AllCredentialsExhausted { tried: 1 }
            }
        );
    }

    #[test]
    fn rate_limit_after_whole_ring_exhausts() {
        let (_, action) = handle_event(
            evaluating(3, 2),
            DispatchEvent::Classified(ErrorClassification::RateLimited),
            &limits(5, 3),
        );
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 3,
                kind: FailureKind::AllCredentialsExhausted { tried: 3 }
            }
        );
    }

    #[test]
    fn rate_limit_bounded_by_max_retries_on_large_ring() {
        let (_, action) = handle_event(
            evaluating(2, 1),
            DispatchEvent::Classified(ErrorClassification::RateLimited),
            &limits(2, 5),
        );
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 2,
                kind: FailureKind::RetriesExhausted
            }
        );
    }

    #[test]
    fn transient_backs_off_then_retries_same_credential() {
        let l = limits(3, 2);
        let (state, action) = handle_event(
            evaluating(1, 0),
            DispatchEvent::Classified(ErrorClassification::Transient),
            &l,
        );
        assert_eq!(action, DispatchAction::Backoff { attempt: 1 });

        let (state, action) = handle_event(state, DispatchEvent::BackoffElapsed, &l);
        assert_eq!(
            state,
            DispatchState::Attempting {
                attempt: 2,
                rate_limited: 0
            }
        );
        assert_eq!(action, DispatchAction::Attempt { attempt: 2 });
    }

    #[test]
    fn transient_with_rotation_rotates_after_backoff() {
        let l = Limits {
            max_retries: 3,
            pool_size: 2,
            rotate_on_transient: true,
        };
        let (state, action) = handle_event(
            DispatchState::Retrying {
                attempt: 1,
                rate_limited: 0,
            },
            DispatchEvent::BackoffElapsed,
            &l,
        );
        assert_eq!(action, DispatchAction::Rotate);
        let (_, action) = handle_event(state, DispatchEvent::Rotated, &l);
        assert_eq!(action, DispatchAction::Attempt { attempt: 2 });
    }

    #[test]
    fn transient_rotation_skipped_on_single_credential() {
        let l = Limits {
            max_retries: 3,
            pool_size: 1,
            rotate_on_transient: true,
        };
        let (_, action) = handle_event(
            DispatchState::Retrying {
                attempt: 1,
                rate_limited: 0,
            },
            DispatchEvent::BackoffElapsed,
            &l,
        );
        assert_eq!(action, DispatchAction::Attempt { attempt: 2 });
    }

    #[test]
    fn transient_on_last_attempt_exhausts_budget() {
        let (_, action) = handle_event(
            evaluating(3, 0),
            DispatchEvent::Classified(ErrorClassification::Transient),
            &limits(3, 2),
        );
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 3,
                kind: FailureKind::RetriesExhausted
            }
        );
    }

    #[test]
    fn rotation_exhausted_is_fatal() {
        let (_, action) = handle_event(
            DispatchState::RotatingCredential {
                attempt: 1,
                rate_limited: 1,
            },
            DispatchEvent::RotationExhausted,
            &limits(3, 2),
        );
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 1,
                kind: FailureKind::AllCredentialsExhausted { tried: 1 }
            }
        );
    }

    #[test]
    fn cancel_from_backoff_stops() {
        let (state, action) = handle_event(
            DispatchState::Retrying {
                attempt: 2,
                rate_limited: 0,
            },
            DispatchEvent::Cancelled,
            &limits(3, 2),
        );
        assert!(state.is_terminal());
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 2,
                kind: FailureKind::Cancelled
            }
        );
    }

    #[test]
    fn pool_unavailable_carries_message() {
        let (_, action) = handle_event(
            DispatchState::Attempting {
                attempt: 1,
                rate_limited: 0,
            },
            DispatchEvent::PoolUnavailable("pool is empty".into()),
            &limits(3, 0),
        );
        assert_eq!(
            action,
            DispatchAction::Fail {
                attempts: 1,
                kind: FailureKind::PoolExhausted("pool is empty".into())
            }
        );
    }

    #[test]
    fn terminal_states_ignore_events() {
        let (state, action) = handle_event(
            DispatchState::Success { attempts: 1 },
            DispatchEvent::Cancelled,
            &limits(3, 2),
        );
        assert_eq!(state, DispatchState::Success { attempts: 1 });
        assert_eq!(action, DispatchAction::None);
    }

    #[test]
    fn unexpected_event_is_noop() {
        let (state, action) = handle_event(
            DispatchState::Idle,
            DispatchEvent::BackoffElapsed,
            &limits(3, 2),
        );
        assert_eq!(state, DispatchState::Idle);
        assert_eq!(action, DispatchAction::None);
    }
}
