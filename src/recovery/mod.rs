//! Error recovery: pluggable strategy chain plus per-operation circuit
//! breakers.
//!
//! # Decision flow
//!
//! ```text
//! execute_with_recovery(ctx, op)
//!   ├─ breaker open for ctx.operation_key? ──▶ CircuitOpen (op NOT invoked)
//!   └─ op()
//!        ├─ Ok  → record success on breaker → Completed
//!        └─ Err → record failure on breaker
//!              └─▶ strategies (priority desc, first can_handle wins)
//!                    ├─ Retry { delay }  → sleep, re-invoke (≤ max_attempts)
//!                    ├─ Skip             → Skipped (deliberate no-op)
//!                    ├─ Fallback         → Degraded (neutral response)
//!                    └─ Escalate         → FailureReport to the caller
//! ```
//!
//! `CircuitOpen` is always terminal for the current call: the breaker exists
//! precisely to stop immediate re-attempts.

pub mod breaker;
pub mod manager;
pub mod strategy;

// ── Public re-exports ──────────────────────────────────────────────────────

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, BreakerStats, CircuitBreaker};
pub use manager::{AttemptVerdict, ErrorRecoveryManager, RecoveryOutcome, RecoveryStats};
pub use strategy::{
    GracefulDegradation, OverloadBackoff, RecoveryAction, RecoveryContext, RecoveryStrategy,
    TimeoutRetry, TransientRetry, ValidationSkip,
};
