//! Recovery strategies: the pluggable "what do we do with this error" chain.
//!
//! Strategies are consulted in priority order (highest first); the first one
//! whose `can_handle` returns `true` decides the [`RecoveryAction`].  The
//! built-in chain:
//!
//! | Strategy              | Handles                      | Verdict              |
//! |-----------------------|------------------------------|----------------------|
//! | [`TimeoutRetry`]      | lock / processing timeouts   | retry with backoff   |
//! | [`TransientRetry`]    | network-class failures       | retry with backoff   |
//! | [`ValidationSkip`]    | malformed input              | skip (deliberate)    |
//! | [`OverloadBackoff`]   | waiter-cap overload          | retry, longer fixed  |
//! | [`GracefulDegradation`] | anything (catch-all)       | neutral fallback     |

use std::time::Duration;

use crate::error::GateError;

// ---------------------------------------------------------------------------
// RecoveryContext
// ---------------------------------------------------------------------------

/// What the strategies (and the breaker table) know about the failing call.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    /// Breaker key, conventionally `"<operation>:<speaker>"`.
    pub operation_key: String,
    /// Speaker whose message is being processed, when applicable.
    pub speaker_id: Option<String>,
    /// Retry budget for the whole call.
    pub max_attempts: u32,
    /// Invocations completed so far (set by the recovery manager).
    pub attempt: u32,
    /// Time since the first invocation (set by the recovery manager).
    pub elapsed: Duration,
}

impl RecoveryContext {
    pub fn new(operation_key: impl Into<String>) -> Self {
        Self {
            operation_key: operation_key.into(),
            speaker_id: None,
            max_attempts: 3,
            attempt: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_speaker(mut self, speaker_id: impl Into<String>) -> Self {
        self.speaker_id = Some(speaker_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// RecoveryAction
// ---------------------------------------------------------------------------

/// A strategy's verdict on a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-invoke the operation after `delay`.
    Retry { delay: Duration },
    /// Substitute a neutral "no action" response; the pipeline continues.
    Fallback,
    /// Treat the message as a deliberate no-op (not a failure).
    Skip,
    /// Propagate the original error to the caller.
    Escalate,
}

// ---------------------------------------------------------------------------
// RecoveryStrategy trait
// ---------------------------------------------------------------------------

/// One link in the recovery chain.  Verdicts are pure decisions; any actual
/// waiting or re-invocation is the recovery manager's job.
pub trait RecoveryStrategy: Send + Sync {
    /// Name used in logs when this strategy claims a failure.
    fn name(&self) -> &'static str;

    /// Chain position; higher runs first.
    fn priority(&self) -> i32;

    fn can_handle(&self, error: &GateError, ctx: &RecoveryContext) -> bool;

    fn recover(&self, error: &GateError, ctx: &RecoveryContext) -> RecoveryAction;
}

/// Shared backoff math: `min(base · 2^attempt, cap)`.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let millis = (base.as_millis() as u64)
        .saturating_mul(factor)
        .min(cap.as_millis() as u64);
    Duration::from_millis(millis)
}

// ---------------------------------------------------------------------------
// TimeoutRetry
// ---------------------------------------------------------------------------

/// Lock-wait and execution timeouts retry with exponential backoff.
pub struct TimeoutRetry {
    pub base: Duration,
    pub cap: Duration,
}

impl RecoveryStrategy for TimeoutRetry {
    fn name(&self) -> &'static str {
        "timeout-retry"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, error: &GateError, _ctx: &RecoveryContext) -> bool {
        error.is_timeout()
    }

    fn recover(&self, _error: &GateError, ctx: &RecoveryContext) -> RecoveryAction {
        RecoveryAction::Retry {
            delay: backoff_delay(self.base, self.cap, ctx.attempt.saturating_sub(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// TransientRetry
// ---------------------------------------------------------------------------

/// Network-class processor failures retry with exponential backoff.
pub struct TransientRetry {
    pub base: Duration,
    pub cap: Duration,
}

impl RecoveryStrategy for TransientRetry {
    fn name(&self) -> &'static str {
        "transient-retry"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn can_handle(&self, error: &GateError, _ctx: &RecoveryContext) -> bool {
        // Timeouts and overload have their own dedicated strategies.
        error.is_transient()
            && !error.is_timeout()
            && !matches!(error, GateError::TooManyWaiters { .. })
    }

    fn recover(&self, _error: &GateError, ctx: &RecoveryContext) -> RecoveryAction {
        RecoveryAction::Retry {
            delay: backoff_delay(self.base, self.cap, ctx.attempt.saturating_sub(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationSkip
// ---------------------------------------------------------------------------

/// Malformed input is skipped; retrying the same bad message can never help.
pub struct ValidationSkip;

impl RecoveryStrategy for ValidationSkip {
    fn name(&self) -> &'static str {
        "validation-skip"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn can_handle(&self, error: &GateError, _ctx: &RecoveryContext) -> bool {
        matches!(error, GateError::Validation(_))
    }

    fn recover(&self, _error: &GateError, _ctx: &RecoveryContext) -> RecoveryAction {
        RecoveryAction::Skip
    }
}

// ---------------------------------------------------------------------------
// OverloadBackoff
// ---------------------------------------------------------------------------

/// Concurrency/overload failures wait out the congestion with a fixed delay
/// deliberately longer than the exponential base.
pub struct OverloadBackoff {
    pub delay: Duration,
}

impl RecoveryStrategy for OverloadBackoff {
    fn name(&self) -> &'static str {
        "overload-backoff"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn can_handle(&self, error: &GateError, _ctx: &RecoveryContext) -> bool {
        matches!(error, GateError::TooManyWaiters { .. })
    }

    fn recover(&self, _error: &GateError, _ctx: &RecoveryContext) -> RecoveryAction {
        RecoveryAction::Retry { delay: self.delay }
    }
}

// ---------------------------------------------------------------------------
// GracefulDegradation
// ---------------------------------------------------------------------------

/// Catch-all: convert an unmodeled error into a neutral "no action taken"
/// response so the caller's pipeline never ends up in an undefined state.
/// Registered only when graceful degradation is enabled in configuration.
pub struct GracefulDegradation;

impl RecoveryStrategy for GracefulDegradation {
    fn name(&self) -> &'static str {
        "graceful-degradation"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn can_handle(&self, _error: &GateError, _ctx: &RecoveryContext) -> bool {
        true
    }

    fn recover(&self, _error: &GateError, _ctx: &RecoveryContext) -> RecoveryAction {
        RecoveryAction::Fallback
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(attempt: u32) -> RecoveryContext {
        let mut c = RecoveryContext::new("process:alice").with_speaker("alice");
        c.attempt = attempt;
        c
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(450);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_millis(450));
        assert_eq!(backoff_delay(base, cap, 80), Duration::from_millis(450));
    }

    #[test]
    fn timeout_retry_claims_both_timeout_classes() {
        let strategy = TimeoutRetry {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(100),
        };
        let lock = GateError::LockTimeout {
            key: "speaker:a".into(),
            waited_ms: 10,
        };
        let exec = GateError::ProcessingTimeout { elapsed_ms: 100 };
        assert!(strategy.can_handle(&lock, &ctx(1)));
        assert!(strategy.can_handle(&exec, &ctx(1)));
        assert_eq!(
            strategy.recover(&exec, &ctx(1)),
            RecoveryAction::Retry {
                delay: Duration::from_millis(10)
            }
        );
    }

    #[test]
    fn transient_retry_excludes_timeouts_and_overload() {
        let strategy = TransientRetry {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(100),
        };
        let network = GateError::Processing {
            message: "connection refused".into(),
            transient: true,
        };
        let overload = GateError::TooManyWaiters {
            key: "k".into(),
            limit: 64,
        };
        assert!(strategy.can_handle(&network, &ctx(1)));
        assert!(!strategy.can_handle(&GateError::ProcessingTimeout { elapsed_ms: 1 }, &ctx(1)));
        assert!(!strategy.can_handle(&overload, &ctx(1)));
    }

    #[test]
    fn validation_skips_instead_of_retrying() {
        let strategy = ValidationSkip;
        let error = GateError::Validation("empty text".into());
        assert!(strategy.can_handle(&error, &ctx(1)));
        assert_eq!(strategy.recover(&error, &ctx(1)), RecoveryAction::Skip);
    }

    #[test]
    fn overload_uses_fixed_longer_delay() {
        let strategy = OverloadBackoff {
            delay: Duration::from_secs(2),
        };
        let error = GateError::TooManyWaiters {
            key: "k".into(),
            limit: 64,
        };
        assert!(strategy.can_handle(&error, &ctx(3)));
        assert_eq!(
            strategy.recover(&error, &ctx(3)),
            RecoveryAction::Retry {
                delay: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn graceful_degradation_catches_everything() {
        let strategy = GracefulDegradation;
        let unknown = GateError::Internal("who knows".into());
        assert!(strategy.can_handle(&unknown, &ctx(1)));
        assert_eq!(strategy.recover(&unknown, &ctx(1)), RecoveryAction::Fallback);
    }
}
