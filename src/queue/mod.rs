//! Bounded-concurrency priority work queue with retry and backoff.
//!
//! # Pipeline flow
//!
//! ```text
//! enqueue(payload, {priority, timeout, max_attempts})
//!   └─▶ pending list, sorted (priority desc, submission order asc)
//!
//! drain(processor)
//!   └─▶ pull up to max_concurrency eligible items
//!         ├─ Ok                         → processed
//!         ├─ Err / timeout, attempts left → re-enqueue after
//!         │                                 min(base · 2^attempt, cap)
//!         └─ Err, attempts exhausted     → failure callback, dropped
//! ```
//!
//! The queue is an independent utility: it knows nothing about speakers or
//! locks.  The gatekeeper layers per-speaker mutual exclusion on top by
//! acquiring the speaker lock inside the processor it supplies.

pub mod priority_queue;
pub mod work_item;

// ── Public re-exports ──────────────────────────────────────────────────────

pub use priority_queue::{PriorityWorkQueue, QueueStats};
pub use work_item::{EnqueueOptions, WorkItem, WorkItemId};
