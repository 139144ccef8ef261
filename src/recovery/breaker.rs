//! Circuit breaker: failure isolation per operation key.
//!
//! One breaker exists per operation key (e.g. `"process:alice"`), created
//! lazily on the first recorded outcome.  The state machine is:
//!
//! ```text
//! Closed ──failures ≥ threshold──▶ Open
//! Open ──elapsed ≥ reset_timeout──▶ HalfOpen   (next allow() call)
//! HalfOpen ──successes ≥ trial count──▶ Closed
//! HalfOpen ──any failure──▶ Open
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BreakerSection;

// ---------------------------------------------------------------------------
// BreakerState
// ---------------------------------------------------------------------------

/// States of one circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    /// Normal operation; calls flow through.
    Closed,
    /// Tripped; calls fail fast until the reset timeout elapses.
    Open,
    /// Trial period; a limited number of calls probe the downstream.
    HalfOpen,
}

impl BreakerState {
    /// A short human-readable label for logs and dashboards.
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Failure-isolation state for one operation key.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_activity: Instant,
    config: BreakerSection,
}

impl CircuitBreaker {
    pub fn new(config: BreakerSection) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_activity: Instant::now(),
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a call may proceed right now.  An `Open` breaker whose reset
    /// timeout has elapsed transitions to `HalfOpen` here and allows the
    /// trial call through.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = self
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout());
                if expired {
                    self.state = BreakerState::HalfOpen;
                    self.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.last_activity = Instant::now();
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.half_open_trial_successes {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.opened_at = None;
                }
            }
            // A success cannot normally be observed while Open (calls are
            // blocked); ignore rather than guess.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_activity = Instant::now();
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::HalfOpen => {
                self.trip();
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            open_for_ms: self
                .opened_at
                .filter(|_| self.state == BreakerState::Open)
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Serialisable view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub open_for_ms: Option<u64>,
}

/// Aggregate view of the breaker table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
    pub per_key: HashMap<String, BreakerSnapshot>,
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Table of breakers keyed by operation, created lazily on first use.
pub struct BreakerRegistry {
    table: Mutex<HashMap<String, CircuitBreaker>>,
    config: BreakerSection,
}

impl BreakerRegistry {
    pub fn new(config: BreakerSection) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Whether a call for `key` may proceed.  A key with no breaker yet is
    /// always allowed (breakers are created lazily on outcomes).
    pub fn allow(&self, key: &str) -> bool {
        let mut table = self.table.lock().unwrap();
        table.get_mut(key).is_none_or(CircuitBreaker::allow)
    }

    /// Record an attempt's outcome against `key`.
    pub fn record(&self, key: &str, success: bool) {
        let mut table = self.table.lock().unwrap();
        let breaker = table
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        let before = breaker.state();
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        let after = breaker.state();
        if before != after {
            match after {
                BreakerState::Open => log::warn!(
                    "circuit breaker '{key}': {} → open ({} consecutive failures)",
                    before.label(),
                    breaker.consecutive_failures
                ),
                _ => log::info!(
                    "circuit breaker '{key}': {} → {}",
                    before.label(),
                    after.label()
                ),
            }
        }
    }

    /// Current state for `key`, if a breaker exists.
    pub fn state(&self, key: &str) -> Option<BreakerState> {
        self.table.lock().unwrap().get(key).map(CircuitBreaker::state)
    }

    /// Operational override: trip the breaker for `key` immediately.
    pub fn force_open(&self, key: &str) {
        let mut table = self.table.lock().unwrap();
        let breaker = table
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        breaker.trip();
        log::warn!("circuit breaker '{key}': forced open");
    }

    /// Operational override: drop the breaker for `key`, returning it to a
    /// clean closed state on next use.
    pub fn reset(&self, key: &str) {
        self.table.lock().unwrap().remove(key);
    }

    /// Drop breakers idle longer than `idle_for`.  Returns how many were
    /// collected.
    pub fn gc(&self, idle_for: Duration) -> usize {
        let mut table = self.table.lock().unwrap();
        let before = table.len();
        table.retain(|_, b| b.last_activity.elapsed() < idle_for);
        before - table.len()
    }

    pub fn stats(&self) -> BreakerStats {
        let table = self.table.lock().unwrap();
        let mut stats = BreakerStats {
            total: table.len(),
            ..BreakerStats::default()
        };
        for (key, breaker) in table.iter() {
            match breaker.state() {
                BreakerState::Open => stats.open += 1,
                BreakerState::HalfOpen => stats.half_open += 1,
                BreakerState::Closed => {}
            }
            stats.per_key.insert(key.clone(), breaker.snapshot());
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(reset_ms: u64) -> BreakerSection {
        BreakerSection {
            failure_threshold: 5,
            reset_timeout_ms: reset_ms,
            half_open_trial_successes: 2,
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut b = CircuitBreaker::new(config(60_000));
        for _ in 0..4 {
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut b = CircuitBreaker::new(config(60_000));
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        for _ in 0..4 {
            b.record_failure();
        }
        // 4 + 4 non-consecutive failures never trip a threshold of 5.
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_reset_then_closes_on_trial_successes() {
        let mut b = CircuitBreaker::new(config(20));
        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());

        std::thread::sleep(Duration::from_millis(25));
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut b = CircuitBreaker::new(config(20));
        for _ in 0..5 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn registry_is_lazy_and_per_key() {
        let registry = BreakerRegistry::new(config(60_000));
        assert!(registry.allow("process:alice"));
        assert!(registry.state("process:alice").is_none());

        for _ in 0..5 {
            registry.record("process:alice", false);
        }
        assert!(!registry.allow("process:alice"));
        // Other keys are unaffected.
        assert!(registry.allow("process:bob"));

        let stats = registry.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.open, 1);
    }

    #[test]
    fn force_open_and_reset() {
        let registry = BreakerRegistry::new(config(60_000));
        registry.force_open("tts:alice");
        assert!(!registry.allow("tts:alice"));
        registry.reset("tts:alice");
        assert!(registry.allow("tts:alice"));
        assert!(registry.state("tts:alice").is_none());
    }

    #[test]
    fn gc_drops_idle_breakers() {
        let registry = BreakerRegistry::new(config(60_000));
        registry.record("stale", false);
        std::thread::sleep(Duration::from_millis(15));
        registry.record("fresh", false);

        assert_eq!(registry.gc(Duration::from_millis(10)), 1);
        assert!(registry.state("stale").is_none());
        assert!(registry.state("fresh").is_some());
    }
}
