//! Keyed mutual exclusion for speaker-scoped processing.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │              KeyedLockManager                          │
//! │                                                        │
//! │   key ──▶ ┌─────────────────────────────┐              │
//! │           │ holder (owner, acquired_at) │              │
//! │           │ waiters: FIFO VecDeque      │──▶ oneshot   │
//! │           └─────────────────────────────┘    grants    │
//! │                                                        │
//! │   background sweep: force-release locks held past      │
//! │   the deadlock threshold, grant the next waiter        │
//! └────────────────────────────────────────────────────────┘
//!                       ▲
//!                       │ key = "speaker:<id>"
//!           SpeakerLockManager (conversational timeout)
//! ```
//!
//! Waiters for the same key are granted strictly FIFO; the work queue's
//! priority ordering applies to *scheduling*, never to lock granting.

pub mod manager;
pub mod speaker;

// ── Public re-exports ──────────────────────────────────────────────────────

pub use manager::{HeldKey, KeyedLockManager, LockGuard, LockStats};
pub use speaker::SpeakerLockManager;
