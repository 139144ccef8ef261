//! Aggregated gatekeeper statistics.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

use crate::lock::LockStats;
use crate::queue::QueueStats;
use crate::recovery::{BreakerStats, RecoveryStats};

// ---------------------------------------------------------------------------
// SpeakerStats
// ---------------------------------------------------------------------------

/// Per-speaker counters, snapshotted for export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeakerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Milliseconds since this speaker last submitted or finished a message.
    pub idle_ms: u64,
}

/// Internal mutable per-speaker record; `snapshot` produces the serialisable
/// view.
#[derive(Debug)]
pub(crate) struct SpeakerTracker {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_activity: Instant,
}

impl SpeakerTracker {
    pub fn new() -> Self {
        Self {
            submitted: 0,
            completed: 0,
            failed: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn snapshot(&self) -> SpeakerStats {
        SpeakerStats {
            submitted: self.submitted,
            completed: self.completed,
            failed: self.failed,
            idle_ms: self.last_activity.elapsed().as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// GateStats
// ---------------------------------------------------------------------------

/// One coherent snapshot across every subsystem, for dashboards and tests.
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub queue: QueueStats,
    pub locks: LockStats,
    pub breakers: BreakerStats,
    pub recovery: RecoveryStats,
    pub speakers: HashMap<String, SpeakerStats>,
    /// Whether a playback gate is currently raised.
    pub gated: bool,
    /// Messages sitting in the playback-gate buffers right now.
    pub gate_buffered: usize,
    /// Messages dropped by the bounded gate buffers since startup.
    pub gate_dropped: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_snapshot_carries_counters() {
        let mut tracker = SpeakerTracker::new();
        tracker.submitted = 4;
        tracker.completed = 3;
        tracker.failed = 1;

        let snap = tracker.snapshot();
        assert_eq!(snap.submitted, 4);
        assert_eq!(snap.completed, 3);
        assert_eq!(snap.failed, 1);
    }

    #[test]
    fn gate_stats_serialise_to_json() {
        let stats = GateStats {
            queue: QueueStats::default(),
            locks: LockStats::default(),
            breakers: BreakerStats::default(),
            recovery: RecoveryStats::default(),
            speakers: HashMap::from([("alice".to_string(), SpeakerStats::default())]),
            gated: false,
            gate_buffered: 0,
            gate_dropped: 0,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"alice\""));
        assert!(json.contains("\"gated\":false"));
    }
}
