//! Generic keyed lock manager with timeout, waiter caps and deadlock recovery.
//!
//! One live holder per key; contending acquisitions queue FIFO behind it and
//! are granted over `tokio::sync::oneshot` channels.  The lock table lives in
//! a `std::sync::Mutex`; every critical section is short and **never** held
//! across an `.await` point.
//!
//! A holder is identified by a per-key `epoch` (generation counter).  When the
//! deadlock sweep force-releases an overdue holder and grants the next waiter,
//! the old guard's eventual drop carries a stale epoch and is ignored, so it
//! can never release the lock out from under the new holder.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::LockSection;
use crate::error::GateError;

// ---------------------------------------------------------------------------
// Table internals
// ---------------------------------------------------------------------------

/// Exclusive ownership of one key.
struct Holder {
    owner_tag: String,
    acquired_at: Instant,
    epoch: u64,
}

/// A queued acquisition waiting behind a held key.
struct Waiter {
    id: u64,
    owner_tag: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant>,
}

/// Sent to a waiter when it becomes the holder.
struct Grant {
    epoch: u64,
}

/// Per-key state: current holder plus FIFO wait list.
struct KeyState {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
    /// Generation counter; each grant for this key gets a fresh epoch.
    next_epoch: u64,
}

impl KeyState {
    fn new() -> Self {
        Self {
            holder: None,
            waiters: VecDeque::new(),
            next_epoch: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }
}

struct LockTable {
    keys: Mutex<HashMap<String, KeyState>>,
    config: LockSection,
    shutdown: AtomicBool,
    next_waiter_id: AtomicU64,

    // Observability counters.
    acquisitions: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
    rejected_waiters: AtomicU64,
    deadlock_releases: AtomicU64,
    stale_releases: AtomicU64,
    total_hold_micros: AtomicU64,
}

impl LockTable {
    fn new(config: LockSection) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            config,
            shutdown: AtomicBool::new(false),
            next_waiter_id: AtomicU64::new(1),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected_waiters: AtomicU64::new(0),
            deadlock_releases: AtomicU64::new(0),
            stale_releases: AtomicU64::new(0),
            total_hold_micros: AtomicU64::new(0),
        }
    }

    /// Install the head waiter as the new holder.  Skips waiters whose
    /// receiver is already gone (cancelled callers).
    fn grant_next(&self, key: &str, state: &mut KeyState) {
        while let Some(waiter) = state.waiters.pop_front() {
            let epoch = state.next_epoch;
            state.next_epoch += 1;
            let owner_tag = waiter.owner_tag.clone();
            if waiter.tx.send(Grant { epoch }).is_ok() {
                log::debug!(
                    "lock '{key}': granted to '{owner_tag}' after {:?} wait",
                    waiter.enqueued_at.elapsed()
                );
                state.holder = Some(Holder {
                    owner_tag,
                    acquired_at: Instant::now(),
                    epoch,
                });
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Whether `epoch` still identifies the live holder of `key`.  False
    /// once deadlock recovery has force-released that generation.
    fn holds_epoch(&self, key: &str, epoch: u64) -> bool {
        let keys = self.keys.lock().unwrap();
        keys.get(key)
            .is_some_and(|state| state.holder.as_ref().is_some_and(|h| h.epoch == epoch))
    }

    /// Release `key` if (and only if) `epoch` still identifies the holder.
    fn release(&self, key: &str, epoch: u64) {
        // Called from Drop: swallow a poisoned mutex instead of panicking.
        let Ok(mut keys) = self.keys.lock() else {
            return;
        };
        let Some(state) = keys.get_mut(key) else {
            self.stale_releases.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !state.holder.as_ref().is_some_and(|h| h.epoch == epoch) {
            // Force-released earlier by deadlock recovery; ignore.
            self.stale_releases.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(holder) = state.holder.take() {
            self.total_hold_micros.fetch_add(
                holder.acquired_at.elapsed().as_micros() as u64,
                Ordering::Relaxed,
            );
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
        self.grant_next(key, state);
        if state.is_empty() {
            keys.remove(key);
        }
    }

    /// Force-release every lock held past the deadlock threshold and grant
    /// the next waiter.  Returns the number of forced releases.
    fn sweep_once(&self) -> usize {
        let mut keys = self.keys.lock().unwrap();
        let threshold = self.config.deadlock_timeout();
        let mut forced = 0;
        for (key, state) in keys.iter_mut() {
            let overdue = state
                .holder
                .as_ref()
                .is_some_and(|h| h.acquired_at.elapsed() >= threshold);
            if !overdue {
                continue;
            }
            if let Some(holder) = state.holder.take() {
                log::warn!(
                    "lock '{key}': held by '{}' for {:?} (threshold {:?}), force-releasing",
                    holder.owner_tag,
                    holder.acquired_at.elapsed(),
                    threshold
                );
                self.deadlock_releases.fetch_add(1, Ordering::Relaxed);
                forced += 1;
            }
            self.grant_next(key, state);
        }
        keys.retain(|_, state| !state.is_empty());
        forced
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// RAII handle to an acquired key.  Dropping it releases the lock and grants
/// the next FIFO waiter.
pub struct LockGuard {
    table: Arc<LockTable>,
    key: String,
    epoch: u64,
}

impl LockGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key, self.epoch);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("epoch", &self.epoch)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stats snapshots
// ---------------------------------------------------------------------------

/// Aggregate lock manager statistics (serialisable for dashboards).
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockStats {
    pub acquisitions: u64,
    pub releases: u64,
    pub timeouts: u64,
    pub rejected_waiters: u64,
    pub deadlock_releases: u64,
    pub stale_releases: u64,
    /// Mean hold time across completed releases, in milliseconds.
    pub avg_hold_ms: f64,
    pub held_keys: usize,
    pub waiting: usize,
}

/// Diagnostic view of one currently held key.
#[derive(Debug, Clone, Serialize)]
pub struct HeldKey {
    pub key: String,
    pub owner_tag: String,
    pub held_ms: u64,
    pub waiters: usize,
}

// ---------------------------------------------------------------------------
// KeyedLockManager
// ---------------------------------------------------------------------------

/// Mutual-exclusion primitive keyed by arbitrary string.
///
/// Must be created inside a tokio runtime when deadlock detection is enabled
/// (the sweep runs as a spawned task).
///
/// ```rust
/// use std::time::Duration;
/// use speaker_gate::config::LockSection;
/// use speaker_gate::lock::KeyedLockManager;
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() {
/// let locks = KeyedLockManager::new(LockSection::default());
/// let guard = locks
///     .acquire("session:42", "example", Duration::from_secs(1))
///     .await
///     .unwrap();
/// assert!(locks.is_held("session:42"));
/// drop(guard);
/// assert!(!locks.is_held("session:42"));
/// # }
/// ```
pub struct KeyedLockManager {
    table: Arc<LockTable>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl KeyedLockManager {
    /// Create a manager and, when `deadlock_detection_enabled`, start the
    /// background sweep task.
    pub fn new(config: LockSection) -> Self {
        let table = Arc::new(LockTable::new(config));
        let sweep = if table.config.deadlock_detection_enabled {
            Some(Self::spawn_sweep(Arc::clone(&table)))
        } else {
            None
        };
        Self {
            table,
            sweep: Mutex::new(sweep),
        }
    }

    fn spawn_sweep(table: Arc<LockTable>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(table.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if table.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                table.sweep_once();
            }
        })
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Acquire `key`, waiting up to `timeout` behind the current holder.
    ///
    /// Grant order among waiters is strictly FIFO.  A waiter that exceeds
    /// `timeout` is removed from the wait list and receives
    /// [`GateError::LockTimeout`]; if the key already has
    /// `max_waiters_per_key` waiters the call fails immediately with
    /// [`GateError::TooManyWaiters`].
    pub async fn acquire(
        &self,
        key: &str,
        owner_tag: &str,
        timeout: Duration,
    ) -> Result<LockGuard, GateError> {
        if self.table.shutdown.load(Ordering::SeqCst) {
            return Err(GateError::ShuttingDown);
        }

        let started = Instant::now();
        let (waiter_id, mut rx) = {
            let mut keys = self.table.keys.lock().unwrap();
            let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);

            // Fast path: free key, grant immediately.
            if state.holder.is_none() && state.waiters.is_empty() {
                let epoch = state.next_epoch;
                state.next_epoch += 1;
                state.holder = Some(Holder {
                    owner_tag: owner_tag.to_string(),
                    acquired_at: Instant::now(),
                    epoch,
                });
                self.table.acquisitions.fetch_add(1, Ordering::Relaxed);
                return Ok(LockGuard {
                    table: Arc::clone(&self.table),
                    key: key.to_string(),
                    epoch,
                });
            }

            let limit = self.table.config.max_waiters_per_key;
            if state.waiters.len() >= limit {
                self.table.rejected_waiters.fetch_add(1, Ordering::Relaxed);
                return Err(GateError::TooManyWaiters {
                    key: key.to_string(),
                    limit,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = self.table.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Waiter {
                id,
                owner_tag: owner_tag.to_string(),
                enqueued_at: Instant::now(),
                tx,
            });
            (id, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(grant)) => Ok(LockGuard {
                table: Arc::clone(&self.table),
                key: key.to_string(),
                epoch: grant.epoch,
            }),
            // Sender dropped without a grant: the manager shut down.
            Ok(Err(_)) => Err(GateError::ShuttingDown),
            Err(_) => {
                let removed = {
                    let mut keys = self.table.keys.lock().unwrap();
                    let removed = keys.get_mut(key).is_some_and(|state| {
                        let before = state.waiters.len();
                        state.waiters.retain(|w| w.id != waiter_id);
                        state.waiters.len() != before
                    });
                    if keys.get(key).is_some_and(KeyState::is_empty) {
                        keys.remove(key);
                    }
                    removed
                };
                if removed {
                    self.table.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(GateError::LockTimeout {
                        key: key.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    })
                } else {
                    // The grant was sent just as the timer fired; the send
                    // happens under the table lock, so it is visible now.
                    match rx.try_recv() {
                        Ok(grant) => Ok(LockGuard {
                            table: Arc::clone(&self.table),
                            key: key.to_string(),
                            epoch: grant.epoch,
                        }),
                        Err(_) => Err(GateError::ShuttingDown),
                    }
                }
            }
        }
    }

    /// Non-blocking acquisition: `Some(guard)` when `key` is free, `None`
    /// when it is held, contended or the manager is shutting down.
    pub fn try_acquire(&self, key: &str, owner_tag: &str) -> Option<LockGuard> {
        if self.table.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        let mut keys = self.table.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);
        if state.holder.is_some() || !state.waiters.is_empty() {
            if state.is_empty() {
                keys.remove(key);
            }
            return None;
        }
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.holder = Some(Holder {
            owner_tag: owner_tag.to_string(),
            acquired_at: Instant::now(),
            epoch,
        });
        self.table.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(LockGuard {
            table: Arc::clone(&self.table),
            key: key.to_string(),
            epoch,
        })
    }

    /// Run `fut` while holding `key`, releasing automatically afterwards,
    /// including when `fut` resolves to an error.
    ///
    /// If the deadlock sweep force-released this holder while `fut` was still
    /// running, mutual exclusion was not upheld for the whole section; a
    /// successful `fut` then comes back as [`GateError::DeadlockRecovered`]
    /// so the caller can treat the work as suspect.  A failing `fut` keeps
    /// its own error, which names the primary cause.
    pub async fn with_lock<T, F>(
        &self,
        key: &str,
        owner_tag: &str,
        timeout: Duration,
        fut: F,
    ) -> Result<T, GateError>
    where
        F: std::future::Future<Output = Result<T, GateError>>,
    {
        let guard = self.acquire(key, owner_tag, timeout).await?;
        let result = fut.await;
        let force_released = !self.table.holds_epoch(key, guard.epoch);
        drop(guard);
        if force_released && result.is_ok() {
            return Err(GateError::DeadlockRecovered {
                key: key.to_string(),
            });
        }
        result
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Whether `key` currently has a live holder.
    pub fn is_held(&self, key: &str) -> bool {
        let keys = self.table.keys.lock().unwrap();
        keys.get(key).is_some_and(|s| s.holder.is_some())
    }

    /// Number of waiters queued behind `key`.
    pub fn waiter_count(&self, key: &str) -> usize {
        let keys = self.table.keys.lock().unwrap();
        keys.get(key).map_or(0, |s| s.waiters.len())
    }

    /// Snapshot of every currently held key with its hold age.
    pub fn held_keys(&self) -> Vec<HeldKey> {
        let keys = self.table.keys.lock().unwrap();
        keys.iter()
            .filter_map(|(key, state)| {
                state.holder.as_ref().map(|h| HeldKey {
                    key: key.clone(),
                    owner_tag: h.owner_tag.clone(),
                    held_ms: h.acquired_at.elapsed().as_millis() as u64,
                    waiters: state.waiters.len(),
                })
            })
            .collect()
    }

    /// Aggregate counters plus current table occupancy.
    pub fn stats(&self) -> LockStats {
        let (held_keys, waiting) = {
            let keys = self.table.keys.lock().unwrap();
            let held = keys.values().filter(|s| s.holder.is_some()).count();
            let waiting = keys.values().map(|s| s.waiters.len()).sum();
            (held, waiting)
        };
        let releases = self.table.releases.load(Ordering::Relaxed);
        let total_micros = self.table.total_hold_micros.load(Ordering::Relaxed);
        let avg_hold_ms = if releases == 0 {
            0.0
        } else {
            total_micros as f64 / releases as f64 / 1_000.0
        };
        LockStats {
            acquisitions: self.table.acquisitions.load(Ordering::Relaxed),
            releases,
            timeouts: self.table.timeouts.load(Ordering::Relaxed),
            rejected_waiters: self.table.rejected_waiters.load(Ordering::Relaxed),
            deadlock_releases: self.table.deadlock_releases.load(Ordering::Relaxed),
            stale_releases: self.table.stale_releases.load(Ordering::Relaxed),
            avg_hold_ms,
            held_keys,
            waiting,
        }
    }

    /// Run one deadlock-detection pass immediately.  Returns the number of
    /// force-released locks.  The background sweep calls this on its interval;
    /// exposed for the gatekeeper's cleanup cycle and for tests.
    pub fn sweep_once(&self) -> usize {
        self.table.sweep_once()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop the sweep task, reject further acquisitions and fail all queued
    /// waiters with [`GateError::ShuttingDown`].  Held guards release as they
    /// drop.  Idempotent.
    pub fn shutdown(&self) {
        self.table.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweep.lock().unwrap().take() {
            handle.abort();
        }
        let mut keys = self.table.keys.lock().unwrap();
        for state in keys.values_mut() {
            // Dropping the senders fails every waiter's receiver.
            state.waiters.clear();
        }
        keys.retain(|_, state| !state.is_empty());
    }
}

impl Drop for KeyedLockManager {
    fn drop(&mut self) {
        if let Ok(mut sweep) = self.sweep.lock() {
            if let Some(handle) = sweep.take() {
                handle.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
