//! Message types and the processor seam.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GateError;

// ---------------------------------------------------------------------------
// MessageEvent
// ---------------------------------------------------------------------------

/// Typed metadata attached to a submission.  Tagged so downstream consumers
/// can route on the event kind without string matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// A speech-to-text result.
    Transcript {
        /// Recognition confidence in `[0, 1]`.
        confidence: f32,
        /// Whether this is a final result or a streaming partial.
        is_final: bool,
    },
    /// The user (or an upstream component) explicitly interrupted playback.
    Interrupt { source: String },
    /// The active speaker changed mid-conversation.
    SpeakerChange { previous: Option<String> },
    /// A silence span was detected.
    Silence { duration_ms: u64 },
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One utterance on its way through the gatekeeper.
#[derive(Debug, Clone)]
pub struct Message {
    /// Gatekeeper-assigned identifier, unique for the process lifetime.
    pub id: u64,
    pub speaker_id: String,
    pub text: String,
    /// Higher = more urgent.
    pub priority: i32,
    /// Optional typed metadata.
    pub event: Option<MessageEvent>,
    pub submitted_at: Instant,
}

// ---------------------------------------------------------------------------
// MessageState
// ---------------------------------------------------------------------------

/// Lifecycle of a tracked message.
///
/// ```text
/// Submitted → Queued → LockWait → Processing ─┬─▶ Completed
///                ▲                            ├─▶ FailedRetry ──▶ (re-queued)
///                └────────────────────────────┘
///                                             └─▶ FailedTerminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageState {
    Submitted,
    Queued,
    LockWait,
    Processing,
    Completed,
    FailedRetry,
    FailedTerminal,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Completed | MessageState::FailedTerminal)
    }
}

// ---------------------------------------------------------------------------
// Submission types
// ---------------------------------------------------------------------------

/// How a submission was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmitMode {
    /// Processed synchronously inside the `submit` call.
    Inline,
    /// Accepted onto the priority queue.
    Queued,
    /// Diverted to the playback-gate buffer; will replay as context.
    Gated,
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Higher = more urgent.  At or above the configured interrupt priority a
    /// message passes straight through an active playback gate.
    pub priority: i32,
    /// Per-execution timeout override for queued processing.
    pub timeout: Option<Duration>,
    /// Process inline (still under the speaker lock and through recovery)
    /// when the speaker is not currently locked.
    pub bypass_queue: bool,
    /// Optional typed metadata.
    pub event: Option<MessageEvent>,
}

/// Returned by `submit` as soon as the message has been routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub accepted: bool,
    pub mode: SubmitMode,
    pub message_id: u64,
}

// ---------------------------------------------------------------------------
// ProcessorResponse
// ---------------------------------------------------------------------------

/// What the conversation logic produced for one message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessorResponse {
    /// Text to speak back, when the logic decided to respond.
    pub text: Option<String>,
}

impl ProcessorResponse {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }

    /// A deliberate no-response (e.g. a partial transcript not worth
    /// answering yet).
    pub fn none() -> Self {
        Self { text: None }
    }
}

// ---------------------------------------------------------------------------
// MessageProcessor
// ---------------------------------------------------------------------------

/// The conversation logic injected into the gatekeeper.
///
/// `process` runs under the speaker lock, through the recovery layer and the
/// circuit breaker.  `add_context` is the lighter hook used when gated
/// messages replay after playback: no lock, no retry, failures logged and
/// dropped.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &Message) -> Result<ProcessorResponse, GateError>;

    /// Absorb a message as conversational context without producing a
    /// response.  Default: ignore.
    async fn add_context(&self, message: &Message) -> Result<(), GateError> {
        let _ = message;
        Ok(())
    }
}

#[async_trait]
impl<P: MessageProcessor + ?Sized> MessageProcessor for Arc<P> {
    async fn process(&self, message: &Message) -> Result<ProcessorResponse, GateError> {
        (**self).process(message).await
    }

    async fn add_context(&self, message: &Message) -> Result<(), GateError> {
        (**self).add_context(message).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialises_with_a_type_tag() {
        let event = MessageEvent::Transcript {
            confidence: 0.92,
            is_final: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"transcript\""));

        let back: MessageEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn interrupt_event_round_trips() {
        let event = MessageEvent::Interrupt {
            source: "wake-word".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: MessageEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(MessageState::Completed.is_terminal());
        assert!(MessageState::FailedTerminal.is_terminal());
        assert!(!MessageState::FailedRetry.is_terminal());
        assert!(!MessageState::Processing.is_terminal());
    }

    #[test]
    fn response_constructors() {
        assert_eq!(
            ProcessorResponse::reply("hello").text.as_deref(),
            Some("hello")
        );
        assert_eq!(ProcessorResponse::none().text, None);
    }
}
