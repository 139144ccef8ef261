//! Recovery manager: drives the strategy chain and the breaker table.
//!
//! Two entry points with one decision core:
//!
//! * [`ErrorRecoveryManager::attempt_once`]: single invocation, verdict
//!   returned to the caller.  Used by the queued path, where the work queue
//!   owns re-enqueueing and backoff and a `Retry` verdict here must not
//!   sleep-and-loop on its own.
//! * [`ErrorRecoveryManager::execute_with_recovery`]: the full inline loop
//!   (invoke, consult, sleep, re-invoke, up to the attempt budget).  Used by
//!   the bypass-queue path where the caller is awaiting the result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::GateConfig;
use crate::error::{FailureReport, GateError};
use crate::recovery::breaker::BreakerRegistry;
use crate::recovery::strategy::{
    GracefulDegradation, OverloadBackoff, RecoveryAction, RecoveryContext, RecoveryStrategy,
    TimeoutRetry, TransientRetry, ValidationSkip,
};

// ---------------------------------------------------------------------------
// Outcomes and verdicts
// ---------------------------------------------------------------------------

/// Terminal result of a fully-recovered call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome<T> {
    /// The operation eventually succeeded.
    Completed(T),
    /// A strategy decided the input should be dropped deliberately.
    Skipped,
    /// The catch-all converted the failure into a neutral response; the
    /// original error is preserved for reporting.
    Degraded { error: GateError },
}

/// Verdict of a single invocation.  Unlike [`RecoveryOutcome`] this includes
/// the non-terminal `Retry` case, which the *caller* acts on: the work queue
/// re-enqueues with backoff, the inline loop sleeps and re-invokes.
#[derive(Debug)]
pub enum AttemptVerdict<T> {
    Completed(T),
    Skipped,
    Degraded { error: GateError },
    /// Re-invoke after `delay`; the attempt budget has room.
    Retry { error: GateError, delay: Duration },
    /// The breaker blocked the call; the operation was NOT invoked.
    FailFast(GateError),
    /// Unrecoverable; propagate to the caller.
    Escalate(GateError),
}

// ---------------------------------------------------------------------------
// RecoveryStats
// ---------------------------------------------------------------------------

/// Aggregate counters for the recovery layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    /// Calls that succeeded after at least one failed invocation.
    pub recovered: u64,
    /// Calls resolved as deliberate no-ops (validation failures).
    pub skipped: u64,
    /// Calls resolved by the graceful-degradation fallback.
    pub degraded: u64,
    /// Calls escalated to the caller (including exhausted retry budgets).
    pub unrecoverable: u64,
    /// Calls rejected by an open breaker without invoking the operation.
    pub fail_fast: u64,
}

// ---------------------------------------------------------------------------
// ErrorRecoveryManager
// ---------------------------------------------------------------------------

/// Owns the strategy chain (sorted by priority, highest first) and the
/// per-operation breaker table.
pub struct ErrorRecoveryManager {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    breakers: BreakerRegistry,
    recovered: AtomicU64,
    skipped: AtomicU64,
    degraded: AtomicU64,
    unrecoverable: AtomicU64,
    fail_fast: AtomicU64,
}

impl ErrorRecoveryManager {
    /// Build the default strategy chain from configuration.
    ///
    /// The catch-all [`GracefulDegradation`] strategy is registered only when
    /// enabled; without it, unmodeled errors escalate.
    pub fn from_config(config: &GateConfig) -> Self {
        let mut strategies: Vec<Arc<dyn RecoveryStrategy>> = vec![
            Arc::new(TimeoutRetry {
                base: config.queue.retry_base_delay(),
                cap: config.queue.retry_max_delay(),
            }),
            Arc::new(TransientRetry {
                base: config.queue.retry_base_delay(),
                cap: config.queue.retry_max_delay(),
            }),
            Arc::new(ValidationSkip),
            Arc::new(OverloadBackoff {
                delay: config.recovery.overload_retry_delay(),
            }),
        ];
        if config.recovery.graceful_degradation_enabled {
            strategies.push(Arc::new(GracefulDegradation));
        }
        let mut manager = Self {
            strategies,
            breakers: BreakerRegistry::new(config.breaker.clone()),
            recovered: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            unrecoverable: AtomicU64::new(0),
            fail_fast: AtomicU64::new(0),
        };
        manager.sort_strategies();
        manager
    }

    /// Register an additional strategy; the chain is re-sorted by priority.
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self.sort_strategies();
        self
    }

    fn sort_strategies(&mut self) {
        self.strategies
            .sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    /// The breaker table, for operational overrides and stats.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Consult the chain: first strategy whose `can_handle` accepts the error
    /// decides.  An error no strategy claims escalates.
    pub fn resolve(&self, error: &GateError, ctx: &RecoveryContext) -> RecoveryAction {
        for strategy in &self.strategies {
            if strategy.can_handle(error, ctx) {
                let action = strategy.recover(error, ctx);
                log::debug!(
                    "recovery '{}': {} claimed {} (attempt {}/{}) → {:?}",
                    ctx.operation_key,
                    strategy.name(),
                    error.kind(),
                    ctx.attempt,
                    ctx.max_attempts,
                    action
                );
                return action;
            }
        }
        RecoveryAction::Escalate
    }

    /// One invocation: breaker gate, call, breaker record, strategy verdict.
    ///
    /// `ctx.attempt` is incremented here when the operation is actually
    /// invoked; a breaker rejection leaves it untouched.
    pub async fn attempt_once<T, F, Fut>(
        &self,
        ctx: &mut RecoveryContext,
        op: F,
    ) -> AttemptVerdict<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GateError>>,
    {
        if !self.breakers.allow(&ctx.operation_key) {
            self.fail_fast.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "recovery '{}': breaker open, failing fast without invoking",
                ctx.operation_key
            );
            return AttemptVerdict::FailFast(GateError::CircuitOpen {
                key: ctx.operation_key.clone(),
            });
        }

        ctx.attempt += 1;
        match op().await {
            Ok(value) => {
                self.breakers.record(&ctx.operation_key, true);
                if ctx.attempt > 1 {
                    self.recovered.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "recovery '{}': succeeded on attempt {}",
                        ctx.operation_key,
                        ctx.attempt
                    );
                }
                AttemptVerdict::Completed(value)
            }
            Err(error) => {
                self.breakers.record(&ctx.operation_key, false);
                match self.resolve(&error, ctx) {
                    RecoveryAction::Retry { delay } => {
                        if ctx.attempt >= ctx.max_attempts {
                            self.unrecoverable.fetch_add(1, Ordering::Relaxed);
                            log::warn!(
                                "recovery '{}': retry budget exhausted after {} attempt(s): {error}",
                                ctx.operation_key,
                                ctx.attempt
                            );
                            AttemptVerdict::Escalate(error)
                        } else {
                            AttemptVerdict::Retry { error, delay }
                        }
                    }
                    RecoveryAction::Skip => {
                        self.skipped.fetch_add(1, Ordering::Relaxed);
                        AttemptVerdict::Skipped
                    }
                    RecoveryAction::Fallback => {
                        self.degraded.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "recovery '{}': degraded to neutral response: {error}",
                            ctx.operation_key
                        );
                        AttemptVerdict::Degraded { error }
                    }
                    RecoveryAction::Escalate => {
                        self.unrecoverable.fetch_add(1, Ordering::Relaxed);
                        AttemptVerdict::Escalate(error)
                    }
                }
            }
        }
    }

    /// Full inline recovery loop: invoke, consult, sleep, re-invoke, until a
    /// terminal verdict or the attempt budget runs out.
    ///
    /// The operation is invoked at most `ctx.max_attempts` times; an open
    /// breaker short-circuits with zero invocations.
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        mut ctx: RecoveryContext,
        op: F,
    ) -> Result<RecoveryOutcome<T>, FailureReport>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GateError>>,
    {
        let started = Instant::now();
        loop {
            ctx.elapsed = started.elapsed();
            match self.attempt_once(&mut ctx, &op).await {
                AttemptVerdict::Completed(value) => {
                    return Ok(RecoveryOutcome::Completed(value));
                }
                AttemptVerdict::Skipped => return Ok(RecoveryOutcome::Skipped),
                AttemptVerdict::Degraded { error } => {
                    return Ok(RecoveryOutcome::Degraded { error });
                }
                AttemptVerdict::Retry { error, delay } => {
                    log::debug!(
                        "recovery '{}': attempt {}/{} failed ({}), retrying in {:?}",
                        ctx.operation_key,
                        ctx.attempt,
                        ctx.max_attempts,
                        error.kind(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                AttemptVerdict::FailFast(error) | AttemptVerdict::Escalate(error) => {
                    return Err(FailureReport {
                        error,
                        attempts: ctx.attempt,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            recovered: self.recovered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            unrecoverable: self.unrecoverable.load(Ordering::Relaxed),
            fail_fast: self.fail_fast.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> GateConfig {
        let mut config = GateConfig::default();
        config.queue.retry_base_delay_ms = 1;
        config.queue.retry_max_delay_ms = 5;
        config.recovery.overload_retry_delay_ms = 2;
        config.breaker.reset_timeout_ms = 30;
        config
    }

    fn ctx(key: &str, max_attempts: u32) -> RecoveryContext {
        RecoveryContext::new(key).with_max_attempts(max_attempts)
    }

    #[tokio::test]
    async fn first_try_success_touches_no_counters() {
        let manager = ErrorRecoveryManager::from_config(&fast_config());
        let result = manager
            .execute_with_recovery(ctx("process:a", 3), || async { Ok::<_, GateError>(42) })
            .await;
        assert_eq!(result, Ok(RecoveryOutcome::Completed(42)));

        let stats = manager.stats();
        assert_eq!(stats.recovered, 0);
        assert_eq!(stats.unrecoverable, 0);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let manager = ErrorRecoveryManager::from_config(&fast_config());
        let calls = AtomicU32::new(0);
        let result = manager
            .execute_with_recovery(ctx("process:a", 5), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(GateError::Processing {
                            message: "connection reset".into(),
                            transient: true,
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(RecoveryOutcome::Completed("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().recovered, 1);
    }

    #[tokio::test]
    async fn persistent_transient_error_invokes_exactly_max_attempts() {
        let manager = ErrorRecoveryManager::from_config(&fast_config());
        let calls = AtomicU32::new(0);
        let result: Result<RecoveryOutcome<()>, _> = manager
            .execute_with_recovery(ctx("process:a", 3), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GateError::Processing {
                        message: "still down".into(),
                        transient: true,
                    })
                }
            })
            .await;

        let report = result.expect_err("should escalate");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.error.kind(), "processing");
        assert_eq!(manager.stats().unrecoverable, 1);
    }

    #[tokio::test]
    async fn validation_failure_skips_without_retrying() {
        let manager = ErrorRecoveryManager::from_config(&fast_config());
        let calls = AtomicU32::new(0);
        let result: Result<RecoveryOutcome<()>, _> = manager
            .execute_with_recovery(ctx("process:a", 3), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GateError::Validation("empty text".into())) }
            })
            .await;
        assert_eq!(result, Ok(RecoveryOutcome::Skipped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().skipped, 1);
    }

    #[tokio::test]
    async fn unmodeled_error_degrades_when_enabled() {
        let manager = ErrorRecoveryManager::from_config(&fast_config());
        let result: Result<RecoveryOutcome<()>, _> = manager
            .execute_with_recovery(ctx("process:a", 3), || async {
                Err(GateError::Internal("worker panicked".into()))
            })
            .await;
        assert_eq!(
            result,
            Ok(RecoveryOutcome::Degraded {
                error: GateError::Internal("worker panicked".into())
            })
        );
        assert_eq!(manager.stats().degraded, 1);
    }

    #[tokio::test]
    async fn unmodeled_error_escalates_when_degradation_disabled() {
        let mut config = fast_config();
        config.recovery.graceful_degradation_enabled = false;
        let manager = ErrorRecoveryManager::from_config(&config);

        let result: Result<RecoveryOutcome<()>, _> = manager
            .execute_with_recovery(ctx("process:a", 3), || async {
                Err(GateError::Internal("worker panicked".into()))
            })
            .await;
        let report = result.expect_err("should escalate");
        assert_eq!(report.attempts, 1);
        assert_eq!(manager.stats().unrecoverable, 1);
    }

    #[tokio::test]
    async fn resolve_prefers_the_highest_priority_strategy() {
        let manager = ErrorRecoveryManager::from_config(&fast_config());
        let timeout = GateError::ProcessingTimeout { elapsed_ms: 100 };
        // TimeoutRetry (priority 100) must claim this before the catch-all.
        let action = manager.resolve(&timeout, &ctx("process:a", 3));
        assert!(matches!(action, RecoveryAction::Retry { .. }));
    }

    #[tokio::test]
    async fn breaker_lifecycle_trips_blocks_and_closes() {
        use crate::recovery::breaker::BreakerState;

        let mut config = fast_config();
        // Keep the catch-all so a permanent error is a single recorded
        // failure per call, not a retried one.
        config.queue.max_attempts = 1;
        let manager = ErrorRecoveryManager::from_config(&config);
        let permanent = || GateError::Processing {
            message: "handler bug".into(),
            transient: false,
        };

        // 5 failing calls trip the breaker (threshold 5).
        for _ in 0..5 {
            let _ = manager
                .execute_with_recovery::<(), _, _>(ctx("process:alice", 1), || async {
                    Err(permanent())
                })
                .await;
        }
        assert_eq!(
            manager.breakers().state("process:alice"),
            Some(BreakerState::Open)
        );

        // 6th call fails fast and never invokes the operation.
        let calls = AtomicU32::new(0);
        let result: Result<RecoveryOutcome<()>, _> = manager
            .execute_with_recovery(ctx("process:alice", 3), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        let report = result.expect_err("breaker must fail fast");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.attempts, 0);
        assert!(matches!(report.error, GateError::CircuitOpen { .. }));
        assert_eq!(manager.stats().fail_fast, 1);

        // After the reset timeout, trial calls flow and two successes close it.
        tokio::time::sleep(Duration::from_millis(40)).await;
        for _ in 0..2 {
            let result = manager
                .execute_with_recovery(ctx("process:alice", 1), || async {
                    Ok::<_, GateError>(())
                })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(
            manager.breakers().state("process:alice"),
            Some(BreakerState::Closed)
        );
    }

    #[tokio::test]
    async fn other_keys_unaffected_by_an_open_breaker() {
        let manager = ErrorRecoveryManager::from_config(&fast_config());
        for _ in 0..5 {
            manager.breakers().record("process:alice", false);
        }
        let result = manager
            .execute_with_recovery(ctx("process:bob", 1), || async { Ok::<_, GateError>(1) })
            .await;
        assert_eq!(result, Ok(RecoveryOutcome::Completed(1)));
    }
}
