//! The gatekeeper itself: routing, the worker loop, lifecycle tracking and
//! shutdown.
//!
//! One `Gatekeeper` owns the whole stack (queue, locks, recovery, playback
//! gate) and runs two background tasks:
//!
//! * the **worker** re-invokes the queue's drain loop whenever work arrives,
//!   acquiring the speaker lock around every processor invocation;
//! * the **cleanup sweep** forgets terminal message states, trims long-idle
//!   speaker counters and garbage-collects idle circuit breakers.  (Deadlocked
//!   locks are swept by the lock manager's own task.)

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::GateConfig;
use crate::error::{FailureReport, GateError};
use crate::lock::{KeyedLockManager, SpeakerLockManager};
use crate::queue::{EnqueueOptions, PriorityWorkQueue};
use crate::recovery::{AttemptVerdict, ErrorRecoveryManager, RecoveryContext};

use super::gate::PlaybackGate;
use super::message::{
    Message, MessageProcessor, MessageState, SubmitAck, SubmitMode, SubmitOptions,
};
use super::stats::{GateStats, SpeakerTracker};

// ---------------------------------------------------------------------------
// Observation sinks
// ---------------------------------------------------------------------------

/// Optional metrics hook; invoked synchronously, so implementations must be
/// cheap (counter bumps, channel sends).
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: &str, value: f64);
}

/// Optional alerting hook for terminal failures.
pub trait AlertSink: Send + Sync {
    fn alert(&self, summary: &str);
}

// ---------------------------------------------------------------------------
// ShutdownReport
// ---------------------------------------------------------------------------

/// Result of a [`Gatekeeper::shutdown`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether all queued work finished within the grace period.
    pub drained: bool,
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

struct Inner {
    config: GateConfig,
    processor: Arc<dyn MessageProcessor>,
    queue: PriorityWorkQueue<Message>,
    locks: Arc<KeyedLockManager>,
    speakers: SpeakerLockManager,
    recovery: ErrorRecoveryManager,
    gate: PlaybackGate,
    speaker_stats: Mutex<HashMap<String, SpeakerTracker>>,
    states: Mutex<HashMap<u64, (MessageState, Instant)>>,
    next_message_id: AtomicU64,
    metrics: Mutex<Option<Arc<dyn MetricsSink>>>,
    alerts: Mutex<Option<Arc<dyn AlertSink>>>,
}

impl Inner {
    fn new_message(&self, speaker_id: &str, text: &str, options: &SubmitOptions) -> Message {
        Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            speaker_id: speaker_id.to_string(),
            text: text.to_string(),
            priority: options.priority,
            event: options.event.clone(),
            submitted_at: Instant::now(),
        }
    }

    fn set_state(&self, id: u64, state: MessageState) {
        self.states.lock().unwrap().insert(id, (state, Instant::now()));
    }

    fn note_submitted(&self, message: &Message) {
        self.set_state(message.id, MessageState::Submitted);
        let mut stats = self.speaker_stats.lock().unwrap();
        let tracker = stats
            .entry(message.speaker_id.clone())
            .or_insert_with(SpeakerTracker::new);
        tracker.submitted += 1;
        tracker.touch();
    }

    fn record_completed(&self, message: &Message) {
        self.set_state(message.id, MessageState::Completed);
        {
            let mut stats = self.speaker_stats.lock().unwrap();
            let tracker = stats
                .entry(message.speaker_id.clone())
                .or_insert_with(SpeakerTracker::new);
            tracker.completed += 1;
            tracker.touch();
        }
        self.emit_metric("gatekeeper.completed", 1.0);
        self.emit_metric(
            "gatekeeper.latency_ms",
            message.submitted_at.elapsed().as_secs_f64() * 1_000.0,
        );
    }

    fn record_terminal(&self, message: &Message, error: &GateError) {
        self.set_state(message.id, MessageState::FailedTerminal);
        {
            let mut stats = self.speaker_stats.lock().unwrap();
            let tracker = stats
                .entry(message.speaker_id.clone())
                .or_insert_with(SpeakerTracker::new);
            tracker.failed += 1;
            tracker.touch();
        }
        self.emit_metric("gatekeeper.failed", 1.0);
        self.emit_alert(&format!(
            "message {} (speaker '{}') failed terminally: {} ({error})",
            message.id,
            message.speaker_id,
            error.kind()
        ));
        log::error!(
            "message {} (speaker '{}') failed terminally: {error}",
            message.id,
            message.speaker_id
        );
    }

    fn emit_metric(&self, metric: &str, value: f64) {
        let sink = self.metrics.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.record(metric, value);
        }
    }

    fn emit_alert(&self, summary: &str) {
        let sink = self.alerts.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.alert(summary);
        }
    }

    fn operation_key(speaker_id: &str) -> String {
        format!("process:{speaker_id}")
    }

    /// One queued execution: speaker lock, then a single recovery-managed
    /// processor invocation.
    ///
    /// The queue owns the retry schedule, so a `Retry` verdict maps to `Err`
    /// (re-enqueue with backoff) and terminal verdicts are absorbed here as
    /// `Ok` after recording the failure; the queue must not retry them.
    async fn process_queued(
        self: Arc<Self>,
        message: Message,
        queue_attempt: u32,
    ) -> Result<(), GateError> {
        self.set_state(message.id, MessageState::LockWait);
        let inner = Arc::clone(&self);
        let msg = message.clone();
        let locked = self
            .speakers
            .with_speaker_lock(&message.speaker_id, "queue-worker", async move {
                inner.set_state(msg.id, MessageState::Processing);
                let mut ctx = RecoveryContext::new(Self::operation_key(&msg.speaker_id))
                    .with_speaker(msg.speaker_id.clone())
                    .with_max_attempts(inner.config.queue.max_attempts);
                // The queue's attempt counter is authoritative.
                ctx.attempt = queue_attempt;
                let processor = Arc::clone(&inner.processor);
                let verdict = inner
                    .recovery
                    .attempt_once(&mut ctx, move || async move {
                        processor.process(&msg).await.map(|_| ())
                    })
                    .await;
                Ok(verdict)
            })
            .await;

        match locked {
            // Lock wait failed; transient, let the queue reschedule.
            Err(error) => {
                self.set_state(message.id, MessageState::FailedRetry);
                Err(error)
            }
            Ok(AttemptVerdict::Completed(())) => {
                self.record_completed(&message);
                Ok(())
            }
            // Deliberate no-op and neutral degradation both resolve the
            // message; the recovery stats carry the distinction.
            Ok(AttemptVerdict::Skipped) | Ok(AttemptVerdict::Degraded { .. }) => {
                self.record_completed(&message);
                Ok(())
            }
            Ok(AttemptVerdict::Retry { error, .. }) => {
                self.set_state(message.id, MessageState::FailedRetry);
                Err(error)
            }
            Ok(AttemptVerdict::FailFast(error)) | Ok(AttemptVerdict::Escalate(error)) => {
                self.record_terminal(&message, &error);
                Ok(())
            }
        }
    }

    /// Inline execution for the bypass path: speaker lock around the full
    /// recovery loop, result returned to the submitting caller.
    async fn process_inline(self: Arc<Self>, message: Message) -> Result<SubmitAck, FailureReport> {
        let id = message.id;
        self.set_state(id, MessageState::LockWait);
        let inner = Arc::clone(&self);
        let msg = message.clone();
        let locked = self
            .speakers
            .with_speaker_lock(&message.speaker_id, "inline", async move {
                inner.set_state(msg.id, MessageState::Processing);
                let ctx = RecoveryContext::new(Self::operation_key(&msg.speaker_id))
                    .with_speaker(msg.speaker_id.clone())
                    .with_max_attempts(inner.config.queue.max_attempts);
                let processor = Arc::clone(&inner.processor);
                let result = inner
                    .recovery
                    .execute_with_recovery(ctx, move || {
                        let processor = Arc::clone(&processor);
                        let msg = msg.clone();
                        async move { processor.process(&msg).await }
                    })
                    .await;
                Ok(result)
            })
            .await;

        match locked {
            Err(error) => {
                self.record_terminal(&message, &error);
                Err(FailureReport::before_attempt(error))
            }
            Ok(Ok(_outcome)) => {
                self.record_completed(&message);
                Ok(SubmitAck {
                    accepted: true,
                    mode: SubmitMode::Inline,
                    message_id: id,
                })
            }
            Ok(Err(report)) => {
                self.record_terminal(&message, &report.error);
                Err(report)
            }
        }
    }

    /// One cleanup sweep: forget aged-out terminal states, trim idle speaker
    /// counters, collect idle breakers.
    fn cleanup_once(&self) {
        let horizon = self.config.recovery.cleanup_interval();
        self.states
            .lock()
            .unwrap()
            .retain(|_, (state, at)| !(state.is_terminal() && at.elapsed() >= horizon));

        let speaker_idle_cap = horizon.saturating_mul(10);
        self.speaker_stats
            .lock()
            .unwrap()
            .retain(|_, tracker| tracker.last_activity.elapsed() < speaker_idle_cap);

        let breaker_idle = self.config.breaker.reset_timeout().saturating_mul(10);
        let collected = self.recovery.breakers().gc(breaker_idle);
        if collected > 0 {
            log::debug!("cleanup sweep collected {collected} idle breaker(s)");
        }
    }
}

// ---------------------------------------------------------------------------
// Gatekeeper
// ---------------------------------------------------------------------------

/// Front door of the crate.  Must be created inside a tokio runtime (the
/// worker and cleanup tasks are spawned in `new`).
pub struct Gatekeeper {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    shutdown: tokio::sync::Mutex<Option<ShutdownReport>>,
}

impl Gatekeeper {
    pub fn new(config: GateConfig, processor: Arc<dyn MessageProcessor>) -> Self {
        let locks = Arc::new(KeyedLockManager::new(config.lock.clone()));
        let speakers = SpeakerLockManager::new(Arc::clone(&locks), &config.lock);
        let inner = Arc::new(Inner {
            processor,
            queue: PriorityWorkQueue::new(config.queue.clone()),
            locks,
            speakers,
            recovery: ErrorRecoveryManager::from_config(&config),
            gate: PlaybackGate::new(config.gate.buffer_capacity),
            speaker_stats: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
            metrics: Mutex::new(None),
            alerts: Mutex::new(None),
            config,
        });

        // Items that exhaust their queue attempts surface here.  Weak
        // reference: the queue lives inside `inner`.
        let weak = Arc::downgrade(&inner);
        inner.queue.set_failure_callback(move |item, error| {
            if let Some(inner) = weak.upgrade() {
                inner.record_terminal(&item.payload, &error);
            }
        });

        let worker = Self::spawn_worker(Arc::clone(&inner));
        let cleanup = Self::spawn_cleanup(Arc::clone(&inner));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
            cleanup: Mutex::new(Some(cleanup)),
            shutdown: tokio::sync::Mutex::new(None),
        }
    }

    /// Install a metrics sink.
    pub fn with_metrics(self, sink: Arc<dyn MetricsSink>) -> Self {
        *self.inner.metrics.lock().unwrap() = Some(sink);
        self
    }

    /// Install an alert sink for terminal failures.
    pub fn with_alerts(self, sink: Arc<dyn AlertSink>) -> Self {
        *self.inner.alerts.lock().unwrap() = Some(sink);
        self
    }

    fn spawn_worker(inner: Arc<Inner>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let drain_inner = Arc::clone(&inner);
                inner
                    .queue
                    .drain(move |message: Message, attempt| {
                        Arc::clone(&drain_inner).process_queued(message, attempt)
                    })
                    .await;
                if inner.queue.is_closed() {
                    break;
                }
                inner.queue.wait_for_work().await;
            }
            log::debug!("gatekeeper worker task exiting");
        })
    }

    fn spawn_cleanup(inner: Arc<Inner>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.recovery.cleanup_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.cleanup_once();
            }
        })
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Route one utterance.  Returns as soon as the message is accepted:
    /// queued and gated submissions never block on processing; the inline
    /// (bypass) path completes the processing before returning.
    pub async fn submit(
        &self,
        speaker_id: &str,
        text: &str,
        options: SubmitOptions,
    ) -> Result<SubmitAck, FailureReport> {
        if self.inner.queue.is_closed() {
            return Err(FailureReport::before_attempt(GateError::ShuttingDown));
        }
        if speaker_id.is_empty() {
            return Err(FailureReport::before_attempt(GateError::Validation(
                "empty speaker id".into(),
            )));
        }

        let mut message = self.inner.new_message(speaker_id, text, &options);
        let id = message.id;
        self.inner.note_submitted(&message);

        // An active playback gate diverts everything below the interrupt
        // threshold.  The divert re-checks the gate under its own lock; if it
        // lowered in between, the message comes back and takes the normal
        // route.
        if self.inner.gate.is_gated()
            && message.priority < self.inner.config.gate.interrupt_priority
        {
            match self.inner.gate.divert(message) {
                Ok(()) => {
                    return Ok(SubmitAck {
                        accepted: true,
                        mode: SubmitMode::Gated,
                        message_id: id,
                    });
                }
                Err(returned) => message = returned,
            }
        }

        if options.bypass_queue && !self.inner.speakers.is_locked(speaker_id) {
            return Arc::clone(&self.inner).process_inline(message).await;
        }

        self.inner.set_state(id, MessageState::Queued);
        self.inner
            .queue
            .enqueue(
                message,
                EnqueueOptions {
                    priority: options.priority,
                    timeout: options.timeout,
                    max_attempts: None,
                },
            )
            .map_err(|error| {
                self.inner.set_state(id, MessageState::FailedTerminal);
                FailureReport::before_attempt(error)
            })?;
        Ok(SubmitAck {
            accepted: true,
            mode: SubmitMode::Queued,
            message_id: id,
        })
    }

    // -----------------------------------------------------------------------
    // Playback gating
    // -----------------------------------------------------------------------

    /// Run `playback` (typically the TTS output) with the gate raised.
    ///
    /// Low- and normal-priority submissions made while the gate is up land in
    /// the bounded per-speaker buffers; when the outermost gate lowers
    /// (whether the playback succeeded or not) they replay through the
    /// processor's `add_context` hook in priority-then-arrival order.  Replay
    /// failures are logged and dropped; they never fail the playback result.
    pub async fn gate_during_tts<F, T>(&self, playback: F) -> T
    where
        F: Future<Output = T>,
    {
        self.inner.gate.begin();
        let result = playback.await;
        let replay = self.inner.gate.end();
        for message in replay {
            match self.inner.processor.add_context(&message).await {
                Ok(()) => self.inner.set_state(message.id, MessageState::Completed),
                Err(error) => {
                    self.inner.set_state(message.id, MessageState::FailedTerminal);
                    log::warn!(
                        "replay: add_context failed for message {} (speaker '{}'): {error}",
                        message.id,
                        message.speaker_id
                    );
                }
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Last known lifecycle state of a tracked message.  Terminal states are
    /// forgotten by the cleanup sweep after one interval.
    pub fn message_state(&self, id: u64) -> Option<MessageState> {
        self.inner
            .states
            .lock()
            .unwrap()
            .get(&id)
            .map(|(state, _)| *state)
    }

    /// One coherent snapshot across queue, locks, breakers, recovery, gate
    /// and per-speaker counters.
    pub fn get_stats(&self) -> GateStats {
        let speakers = self
            .inner
            .speaker_stats
            .lock()
            .unwrap()
            .iter()
            .map(|(id, tracker)| (id.clone(), tracker.snapshot()))
            .collect();
        GateStats {
            queue: self.inner.queue.stats(),
            locks: self.inner.locks.stats(),
            breakers: self.inner.recovery.breakers().stats(),
            recovery: self.inner.recovery.stats(),
            speakers,
            gated: self.inner.gate.is_gated(),
            gate_buffered: self.inner.gate.buffered(),
            gate_dropped: self.inner.gate.dropped(),
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop accepting work, drain what is queued within `grace`, then release
    /// everything.  Idempotent: a second call returns the recorded report
    /// without doing anything.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut slot = self.shutdown.lock().await;
        if let Some(report) = slot.as_ref() {
            return report.clone();
        }

        log::info!("gatekeeper shutting down (grace {:?})", grace);
        self.inner.queue.close();

        let handle = self.worker.lock().unwrap().take();
        let drained = if let Some(mut handle) = handle {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(joined) => {
                    if let Err(error) = joined {
                        log::warn!("worker task ended abnormally: {error}");
                    }
                    true
                }
                Err(_) => {
                    handle.abort();
                    log::warn!(
                        "shutdown grace expired with {} item(s) pending",
                        self.inner.queue.depth() + self.inner.queue.in_flight()
                    );
                    false
                }
            }
        } else {
            true
        };

        if let Some(handle) = self.cleanup.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.locks.shutdown();

        let report = ShutdownReport { drained };
        *slot = Some(report.clone());
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
