//! Speaker lock manager: per-speaker mutual exclusion.
//!
//! A thin specialisation of [`KeyedLockManager`] that maps a speaker identity
//! to the lock key `"speaker:<id>"` and applies the shorter conversational
//! default timeout from [`LockSection::speaker_lock_timeout_ms`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::LockSection;
use crate::error::GateError;
use crate::lock::manager::KeyedLockManager;

// ---------------------------------------------------------------------------
// SpeakerLockManager
// ---------------------------------------------------------------------------

/// Serialises processing per conversational speaker.
///
/// Shares the underlying [`KeyedLockManager`] with the rest of the system so
/// the deadlock sweep and statistics cover speaker locks too.
pub struct SpeakerLockManager {
    locks: Arc<KeyedLockManager>,
    timeout: Duration,
}

impl SpeakerLockManager {
    const KEY_PREFIX: &'static str = "speaker:";

    /// Create a speaker lock manager over an existing keyed lock manager.
    pub fn new(locks: Arc<KeyedLockManager>, config: &LockSection) -> Self {
        Self {
            locks,
            timeout: config.speaker_lock_timeout(),
        }
    }

    fn lock_key(speaker_id: &str) -> String {
        format!("{}{speaker_id}", Self::KEY_PREFIX)
    }

    /// Run `fut` while holding the speaker's lock, releasing automatically,
    /// including when `fut` resolves to an error.
    ///
    /// `label` is a diagnostic owner tag that shows up in lock statistics and
    /// deadlock-recovery logs.
    pub async fn with_speaker_lock<T, F>(
        &self,
        speaker_id: &str,
        label: &str,
        fut: F,
    ) -> Result<T, GateError>
    where
        F: std::future::Future<Output = Result<T, GateError>>,
    {
        self.locks
            .with_lock(&Self::lock_key(speaker_id), label, self.timeout, fut)
            .await
    }

    /// Whether this speaker is currently being processed.
    pub fn is_locked(&self, speaker_id: &str) -> bool {
        self.locks.is_held(&Self::lock_key(speaker_id))
    }

    /// Speaker identities with a live lock, for diagnostics.
    pub fn locked_speakers(&self) -> Vec<String> {
        self.locks
            .held_keys()
            .into_iter()
            .filter_map(|held| {
                held.key
                    .strip_prefix(Self::KEY_PREFIX)
                    .map(str::to_string)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
