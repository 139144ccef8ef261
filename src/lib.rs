//! speaker-gate: concurrent message gatekeeper for a conversational voice
//! pipeline.
//!
//! A real-time conversation loop (audio capture → STT → conversation logic →
//! TTS) receives utterances tagged with a speaker identity.  This crate is the
//! piece between "an utterance arrived" and "the conversation logic ran":
//!
//! * **at most one** processing operation runs per speaker at any instant,
//! * work is ordered by priority while staying fair,
//! * transient failures retry with bounded exponential backoff,
//! * a circuit breaker sheds load from a systematically failing operation,
//! * low-priority input is buffered while TTS playback is in flight.
//!
//! # Architecture
//!
//! ```text
//! submit(speaker, text)
//!   └─▶ Gatekeeper ──gated?──▶ per-speaker bounded buffer (replayed on ungate)
//!          │
//!          ├─ bypass + unlocked ─▶ inline processing
//!          └─ otherwise ────────▶ PriorityWorkQueue
//!                                    └─▶ SpeakerLockManager (FIFO, per key)
//!                                          └─▶ ErrorRecoveryManager
//!                                                ├─ CircuitBreaker (per op key)
//!                                                └─▶ MessageProcessor (yours)
//! ```
//!
//! The crate has no global state: construct a [`gatekeeper::Gatekeeper`] with
//! a [`config::GateConfig`] and your [`gatekeeper::MessageProcessor`] and
//! inject it into whatever owns the conversation pipeline.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use speaker_gate::config::GateConfig;
//! use speaker_gate::gatekeeper::{
//!     Gatekeeper, Message, MessageProcessor, ProcessorResponse, SubmitOptions,
//! };
//! use speaker_gate::error::GateError;
//! use async_trait::async_trait;
//!
//! struct EchoProcessor;
//!
//! #[async_trait]
//! impl MessageProcessor for EchoProcessor {
//!     async fn process(&self, message: &Message) -> Result<ProcessorResponse, GateError> {
//!         Ok(ProcessorResponse::reply(format!("heard: {}", message.text)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let keeper = Gatekeeper::new(GateConfig::default(), Arc::new(EchoProcessor));
//!     let ack = keeper
//!         .submit("alice", "hello there", SubmitOptions::default())
//!         .await
//!         .unwrap();
//!     assert!(ack.accepted);
//!     keeper.shutdown(std::time::Duration::from_secs(5)).await;
//! }
//! ```

pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod lock;
pub mod queue;
pub mod recovery;
