//! Playback gate: diverts low-priority input while TTS output is in flight.
//!
//! While the gate is raised, normal submissions land in a bounded per-speaker
//! buffer instead of the work queue.  When the last nested gate lowers, the
//! buffered messages are handed back in priority-then-arrival order so the
//! gatekeeper can replay them as conversational context.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::message::Message;

// ---------------------------------------------------------------------------
// PlaybackGate
// ---------------------------------------------------------------------------

struct GateInner {
    /// Nesting depth; the gate is raised while this is non-zero.
    depth: u32,
    /// Arrival order across all speakers, for the replay tie-break.
    next_seq: u64,
    buffers: HashMap<String, VecDeque<(u64, Message)>>,
}

/// Bounded drop-oldest buffer of messages that arrived during playback.
pub struct PlaybackGate {
    inner: Mutex<GateInner>,
    capacity: usize,
    dropped: AtomicU64,
}

impl PlaybackGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                depth: 0,
                next_seq: 0,
                buffers: HashMap::new(),
            }),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Raise the gate (nests).
    pub fn begin(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.depth += 1;
        log::debug!("playback gate raised (depth {})", inner.depth);
    }

    pub fn is_gated(&self) -> bool {
        self.inner.lock().unwrap().depth > 0
    }

    /// Buffer a message for its speaker.  At capacity the oldest buffered
    /// message for that speaker is dropped with a warning.
    ///
    /// The gate state is re-checked under the buffer mutex: if the gate
    /// lowered since the caller observed it raised, the message is handed
    /// back unbuffered so the caller can route it normally.  Buffering it
    /// anyway would strand it, since the replay that drains the buffers has
    /// already run.
    pub fn divert(&self, message: Message) -> Result<(), Message> {
        let mut inner = self.inner.lock().unwrap();
        if inner.depth == 0 {
            return Err(message);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let buffer = inner.buffers.entry(message.speaker_id.clone()).or_default();
        if buffer.len() >= self.capacity {
            if let Some((_, dropped)) = buffer.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "playback gate: buffer for speaker '{}' full ({}), dropping oldest message {}",
                    dropped.speaker_id,
                    self.capacity,
                    dropped.id
                );
            }
        }
        buffer.push_back((seq, message));
        Ok(())
    }

    /// Lower the gate one level.  When the outermost level lowers, every
    /// buffered message is returned in priority-descending, then
    /// arrival-ascending order; otherwise the buffers stay put and the result
    /// is empty.
    pub fn end(&self) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth > 0 {
            return Vec::new();
        }
        let mut entries: Vec<(u64, Message)> = inner
            .buffers
            .drain()
            .flat_map(|(_, buffer)| buffer.into_iter())
            .collect();
        entries.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority.cmp(&a.priority).then(seq_a.cmp(seq_b))
        });
        log::debug!("playback gate lowered, replaying {} message(s)", entries.len());
        entries.into_iter().map(|(_, message)| message).collect()
    }

    /// Messages currently buffered across all speakers.
    pub fn buffered(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .buffers
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Messages dropped to the bounded-buffer policy since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn message(id: u64, speaker: &str, priority: i32) -> Message {
        Message {
            id,
            speaker_id: speaker.to_string(),
            text: format!("msg-{id}"),
            priority,
            event: None,
            submitted_at: Instant::now(),
        }
    }

    #[test]
    fn replay_is_priority_then_arrival_order() {
        let gate = PlaybackGate::new(10);
        gate.begin();
        gate.divert(message(1, "alice", 0)).unwrap();
        gate.divert(message(2, "alice", 5)).unwrap();
        gate.divert(message(3, "bob", 0)).unwrap();
        gate.divert(message(4, "bob", 5)).unwrap();

        let replay = gate.end();
        let ids: Vec<u64> = replay.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 4, 1, 3]);
        assert_eq!(gate.buffered(), 0);
        assert!(!gate.is_gated());
    }

    #[test]
    fn buffer_drops_oldest_at_capacity() {
        let gate = PlaybackGate::new(2);
        gate.begin();
        gate.divert(message(1, "alice", 0)).unwrap();
        gate.divert(message(2, "alice", 0)).unwrap();
        gate.divert(message(3, "alice", 0)).unwrap();

        assert_eq!(gate.buffered(), 2);
        assert_eq!(gate.dropped(), 1);

        let ids: Vec<u64> = gate.end().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn capacity_is_per_speaker() {
        let gate = PlaybackGate::new(1);
        gate.begin();
        gate.divert(message(1, "alice", 0)).unwrap();
        gate.divert(message(2, "bob", 0)).unwrap();
        assert_eq!(gate.buffered(), 2);
        assert_eq!(gate.dropped(), 0);
        gate.end();
    }

    #[test]
    fn nested_gates_release_only_at_outermost_end() {
        let gate = PlaybackGate::new(10);
        gate.begin();
        gate.begin();
        gate.divert(message(1, "alice", 0)).unwrap();

        assert!(gate.end().is_empty());
        assert!(gate.is_gated());

        let replay = gate.end();
        assert_eq!(replay.len(), 1);
        assert!(!gate.is_gated());
    }

    #[test]
    fn end_when_never_gated_is_harmless() {
        let gate = PlaybackGate::new(10);
        assert!(gate.end().is_empty());
        assert!(!gate.is_gated());
    }

    #[test]
    fn divert_after_gate_lowered_hands_message_back() {
        let gate = PlaybackGate::new(10);
        gate.begin();
        gate.end();

        // A caller that raced the lowering gets its message back instead of
        // having it stranded in a buffer no replay will ever drain.
        let rejected = gate.divert(message(1, "alice", 0)).unwrap_err();
        assert_eq!(rejected.id, 1);
        assert_eq!(gate.buffered(), 0);
        assert!(!gate.is_gated());
    }
}
