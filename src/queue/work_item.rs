//! Work item type and queue ordering rules.

use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// WorkItemId
// ---------------------------------------------------------------------------

/// Opaque identifier returned by `enqueue`, usable for explicit removal.
pub type WorkItemId = u64;

// ---------------------------------------------------------------------------
// EnqueueOptions
// ---------------------------------------------------------------------------

/// Per-item overrides supplied at enqueue time.  `None` fields fall back to
/// the queue's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher = more urgent.  Items of equal priority run in submission order.
    pub priority: i32,
    /// Per-execution timeout override.
    pub timeout: Option<Duration>,
    /// Maximum invocations override.
    pub max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One unit of queued work.
///
/// Lifecycle: created on enqueue; re-enqueued at the tail of its priority
/// band on retry (eligible again only after its backoff deadline); destroyed
/// on success, exhaustion or explicit removal.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    pub id: WorkItemId,
    pub payload: T,
    pub priority: i32,
    pub enqueued_at: Instant,
    /// Invocations so far; starts at 0.
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Tie-break within a priority band.  Reassigned on retry so a retried
    /// item lands at the tail of its band.
    pub(crate) seq: u64,
    /// Backoff deadline; the item is ineligible until this instant.
    pub(crate) not_before: Option<tokio::time::Instant>,
}

impl<T> WorkItem<T> {
    /// Whether this item may be pulled right now.
    pub(crate) fn eligible(&self, now: tokio::time::Instant) -> bool {
        self.not_before.is_none_or(|deadline| deadline <= now)
    }
}

/// Sort the pending list into execution order: priority descending, then
/// submission sequence ascending (stable FIFO tie-break).
pub(crate) fn sort_pending<T>(pending: &mut [WorkItem<T>]) {
    pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u64, priority: i32, seq: u64) -> WorkItem<&'static str> {
        WorkItem {
            id,
            payload: "x",
            priority,
            enqueued_at: Instant::now(),
            attempt: 0,
            max_attempts: 3,
            timeout: Duration::from_secs(1),
            seq,
            not_before: None,
        }
    }

    #[test]
    fn higher_priority_sorts_first() {
        let mut pending = vec![item(1, 1, 0), item(2, 10, 1), item(3, 5, 2)];
        sort_pending(&mut pending);
        let order: Vec<u64> = pending.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_priority_keeps_submission_order() {
        let mut pending = vec![item(1, 5, 0), item(2, 5, 1), item(3, 5, 2)];
        sort_pending(&mut pending);
        let order: Vec<u64> = pending.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn retried_item_moves_to_tail_of_its_band() {
        let mut first = item(1, 5, 0);
        let second = item(2, 5, 1);
        // Retry reassigns a fresh sequence number.
        first.seq = 2;
        let mut pending = vec![first, second];
        sort_pending(&mut pending);
        let order: Vec<u64> = pending.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn backoff_deadline_controls_eligibility() {
        let now = tokio::time::Instant::now();
        let mut it = item(1, 0, 0);
        assert!(it.eligible(now));
        it.not_before = Some(now + Duration::from_millis(100));
        assert!(!it.eligible(now));
        assert!(it.eligible(now + Duration::from_millis(100)));
    }
}
