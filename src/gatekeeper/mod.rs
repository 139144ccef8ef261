//! The gatekeeper: one front door for every utterance.
//!
//! ```text
//!                  submit(speaker, text, options)
//!                               │
//!               ┌───────────────┼──────────────────┐
//!               ▼               ▼                  ▼
//!          gate raised?    bypass_queue &     otherwise
//!          (low priority)  speaker unlocked       │
//!               │               │                 ▼
//!       per-speaker buffer   inline          PriorityWorkQueue
//!       (drop-oldest,        processing           │
//!        replay on ungate)      └────────┬────────┘
//!                                        ▼
//!                               speaker lock (FIFO)
//!                                        ▼
//!                               recovery + breaker
//!                                        ▼
//!                               MessageProcessor
//! ```
//!
//! Submodules: [`message`] (types and the processor seam), [`gate`] (playback
//! gating), [`stats`] (aggregated snapshots), [`keeper`] (the orchestrator).

pub mod gate;
pub mod keeper;
pub mod message;
pub mod stats;

// ── Public re-exports ──────────────────────────────────────────────────────

pub use gate::PlaybackGate;
pub use keeper::{AlertSink, Gatekeeper, MetricsSink, ShutdownReport};
pub use message::{
    Message, MessageEvent, MessageProcessor, MessageState, ProcessorResponse, SubmitAck,
    SubmitMode, SubmitOptions,
};
pub use stats::{GateStats, SpeakerStats};
