//! Crate-wide error taxonomy.
//!
//! Every failure that can cross a component boundary is a [`GateError`]
//! variant.  The recovery layer never inspects error *strings*; it routes on
//! the variant plus the [`GateError::is_transient`] and
//! [`GateError::is_timeout`] classification helpers, so adding a variant
//! forces the match arms to be revisited.

use thiserror::Error;

// ---------------------------------------------------------------------------
// GateError
// ---------------------------------------------------------------------------

/// Errors surfaced by the lock manager, work queue, recovery layer and
/// gatekeeper.
///
/// All variants are cloneable so a single failure can be reported to the
/// caller, the stats counters and the alert sink without ownership games.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    /// A lock acquisition waited longer than its timeout.
    #[error("timed out after {waited_ms} ms waiting for lock '{key}'")]
    LockTimeout { key: String, waited_ms: u64 },

    /// The per-key waiter cap was reached; the request was rejected rather
    /// than queued unbounded.
    #[error("too many waiters for lock '{key}' (limit {limit})")]
    TooManyWaiters { key: String, limit: usize },

    /// A lock held past the deadlock threshold was force-released by the
    /// background sweep while its holder was still inside the critical
    /// section.  Returned to that holder when its scoped section completes;
    /// also recorded in statistics.
    #[error("lock '{key}' was force-released by deadlock recovery")]
    DeadlockRecovered { key: String },

    /// A processing operation exceeded its per-execution timeout.
    #[error("processing timed out after {elapsed_ms} ms")]
    ProcessingTimeout { elapsed_ms: u64 },

    /// The message processor itself failed.  `transient` tells the recovery
    /// layer whether a retry is worth attempting (network-class failures are
    /// transient; logic bugs are not).
    #[error("processing failed: {message}")]
    Processing { message: String, transient: bool },

    /// The message was malformed or otherwise unprocessable.  Validation
    /// failures are skipped, never retried.
    #[error("invalid message: {0}")]
    Validation(String),

    /// The circuit breaker for this operation key is open; the operation was
    /// NOT invoked.  Terminal for the current call, never retried inline.
    #[error("circuit breaker open for '{key}'")]
    CircuitOpen { key: String },

    /// The component is shutting down and accepts no new work.
    #[error("shutting down, no new work accepted")]
    ShuttingDown,

    /// Unexpected internal failure (e.g. a worker task panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Short machine-readable kind, used in structured failure reports and
    /// metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::LockTimeout { .. } => "lock_timeout",
            GateError::TooManyWaiters { .. } => "too_many_waiters",
            GateError::DeadlockRecovered { .. } => "deadlock_recovered",
            GateError::ProcessingTimeout { .. } => "processing_timeout",
            GateError::Processing { .. } => "processing",
            GateError::Validation(_) => "validation",
            GateError::CircuitOpen { .. } => "circuit_open",
            GateError::ShuttingDown => "shutting_down",
            GateError::Internal(_) => "internal",
        }
    }

    /// Returns `true` for timeout-class failures (lock wait or execution).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GateError::LockTimeout { .. } | GateError::ProcessingTimeout { .. }
        )
    }

    /// Returns `true` when retrying the operation could plausibly succeed.
    ///
    /// `CircuitOpen` is deliberately *not* transient: the breaker exists
    /// precisely to stop immediate re-attempts.
    pub fn is_transient(&self) -> bool {
        match self {
            GateError::LockTimeout { .. }
            | GateError::ProcessingTimeout { .. }
            | GateError::TooManyWaiters { .. } => true,
            GateError::Processing { transient, .. } => *transient,
            GateError::DeadlockRecovered { .. }
            | GateError::Validation(_)
            | GateError::CircuitOpen { .. }
            | GateError::ShuttingDown
            | GateError::Internal(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// FailureReport
// ---------------------------------------------------------------------------

/// Structured terminal failure handed back across the public boundary.
///
/// A submit call that ultimately fails returns one of these (kind, message,
/// attempt count, elapsed time), never an unstructured panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// The final error after all recovery attempts.
    pub error: GateError,
    /// How many times the operation was actually invoked.
    pub attempts: u32,
    /// Wall-clock time from first attempt to terminal failure.
    pub elapsed_ms: u64,
}

impl FailureReport {
    /// Report a failure that occurred before any attempt was made
    /// (e.g. open breaker, shutdown in progress).
    pub fn before_attempt(error: GateError) -> Self {
        Self {
            error,
            attempts: 0,
            elapsed_ms: 0,
        }
    }
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} attempt(s), {} ms): {}",
            self.error.kind(),
            self.attempts,
            self.elapsed_ms,
            self.error
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let e = GateError::LockTimeout {
            key: "speaker:a".into(),
            waited_ms: 100,
        };
        assert!(e.is_timeout());
        assert!(e.is_transient());

        let e = GateError::ProcessingTimeout { elapsed_ms: 30_000 };
        assert!(e.is_timeout());
        assert!(e.is_transient());
    }

    #[test]
    fn processing_transience_follows_flag() {
        let transient = GateError::Processing {
            message: "connection reset".into(),
            transient: true,
        };
        let permanent = GateError::Processing {
            message: "nil deref in handler".into(),
            transient: false,
        };
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert!(!transient.is_timeout());
    }

    #[test]
    fn circuit_open_is_never_transient() {
        let e = GateError::CircuitOpen {
            key: "process:alice".into(),
        };
        assert!(!e.is_transient());
        assert!(!e.is_timeout());
    }

    #[test]
    fn validation_is_not_transient() {
        assert!(!GateError::Validation("empty text".into()).is_transient());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(GateError::ShuttingDown.kind(), "shutting_down");
        assert_eq!(
            GateError::TooManyWaiters {
                key: "k".into(),
                limit: 64
            }
            .kind(),
            "too_many_waiters"
        );
    }

    #[test]
    fn failure_report_display_includes_kind_and_attempts() {
        let report = FailureReport {
            error: GateError::ProcessingTimeout { elapsed_ms: 500 },
            attempts: 3,
            elapsed_ms: 1_600,
        };
        let s = report.to_string();
        assert!(s.contains("processing_timeout"));
        assert!(s.contains("3 attempt(s)"));
    }

    #[test]
    fn before_attempt_records_zero_attempts() {
        let report = FailureReport::before_attempt(GateError::ShuttingDown);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.elapsed_ms, 0);
    }
}
