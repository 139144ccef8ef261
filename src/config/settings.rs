//! Gatekeeper settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Durations are stored as integer milliseconds in the file; components
//! convert with the `*_ms` accessor helpers.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::GatePaths;

// ---------------------------------------------------------------------------
// QueueSection
// ---------------------------------------------------------------------------

/// Settings for the priority work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    /// Maximum number of work items in flight simultaneously.
    pub max_concurrency: usize,
    /// Per-execution timeout in milliseconds; exceeding it counts as a
    /// processor failure (subject to retry).
    pub processing_timeout_ms: u64,
    /// Maximum invocations per work item before it is handed to the failure
    /// callback and dropped.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Cap on the exponential retry backoff, in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            processing_timeout_ms: 30_000,
            max_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl QueueSection {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// LockSection
// ---------------------------------------------------------------------------

/// Settings for the keyed / speaker lock managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSection {
    /// Default wait budget for a speaker lock, in milliseconds.  Shorter than
    /// the generic lock timeout; conversational latency budgets are tight.
    pub speaker_lock_timeout_ms: u64,
    /// Maximum queued waiters per key before acquisitions are rejected with
    /// `TooManyWaiters`.
    pub max_waiters_per_key: usize,
    /// Whether the background deadlock-detection sweep runs at all.
    pub deadlock_detection_enabled: bool,
    /// Age past which a held lock is force-released, in milliseconds.
    /// Defaults to 2× the speaker lock timeout.
    pub deadlock_timeout_ms: u64,
    /// Interval between deadlock-detection sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            speaker_lock_timeout_ms: 15_000,
            max_waiters_per_key: 64,
            deadlock_detection_enabled: true,
            deadlock_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl LockSection {
    pub fn speaker_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.speaker_lock_timeout_ms)
    }

    pub fn deadlock_timeout(&self) -> Duration {
        Duration::from_millis(self.deadlock_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// BreakerSection
// ---------------------------------------------------------------------------

/// Settings for the per-operation circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive failures that trip the breaker from Closed to Open.
    pub failure_threshold: u32,
    /// Milliseconds an Open breaker waits before allowing a half-open trial.
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes required to close the breaker again.
    pub half_open_trial_successes: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_trial_successes: 2,
        }
    }
}

impl BreakerSection {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// GateSection
// ---------------------------------------------------------------------------

/// Settings for playback gating (low-priority input diverted while TTS runs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSection {
    /// Maximum buffered messages per speaker while gated; the oldest entry is
    /// dropped (with a logged warning) on overflow.
    pub buffer_capacity: usize,
    /// Messages at this priority or above bypass gating entirely
    /// (explicit interrupts).
    pub interrupt_priority: i32,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            interrupt_priority: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// RecoverySection
// ---------------------------------------------------------------------------

/// Settings for the error recovery manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySection {
    /// When enabled, the catch-all strategy converts unmodeled errors into a
    /// neutral "no action" response instead of escalating.
    pub graceful_degradation_enabled: bool,
    /// Fixed retry delay for concurrency/overload-class failures, in
    /// milliseconds.  Deliberately longer than the exponential base.
    pub overload_retry_delay_ms: u64,
    /// Interval between gatekeeper cleanup sweeps (stale bookkeeping,
    /// breaker GC), in milliseconds.
    pub cleanup_interval_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            graceful_degradation_enabled: true,
            overload_retry_delay_ms: 2_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

impl RecoverySection {
    pub fn overload_retry_delay(&self) -> Duration {
        Duration::from_millis(self.overload_retry_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// GateConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level gatekeeper configuration, serialised as `gatekeeper.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use speaker_gate::config::GateConfig;
///
/// // Load (returns Default when file is missing)
/// let config = GateConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Priority work queue settings.
    #[serde(default)]
    pub queue: QueueSection,
    /// Keyed / speaker lock settings.
    #[serde(default)]
    pub lock: LockSection,
    /// Circuit breaker settings.
    #[serde(default)]
    pub breaker: BreakerSection,
    /// Playback gating settings.
    #[serde(default)]
    pub gate: GateSection,
    /// Error recovery settings.
    #[serde(default)]
    pub recovery: RecoverySection,
}

impl GateConfig {
    /// Load configuration from the platform-appropriate `gatekeeper.toml`.
    ///
    /// Returns `Ok(GateConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&GatePaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `gatekeeper.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&GatePaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Verify that a default `GateConfig` can be serialised to TOML and
    /// deserialised back without any data loss.
    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gatekeeper.toml");

        let original = GateConfig::default();
        original.save_to(&path).expect("save");

        let loaded = GateConfig::load_from(&path).expect("load");
        assert_eq!(original, loaded);
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = GateConfig::load_from(&path).expect("should not error");
        assert_eq!(config, GateConfig::default());
    }

    /// Verify default values match the documented configuration surface.
    #[test]
    fn default_values_match_documented_surface() {
        let cfg = GateConfig::default();

        assert_eq!(cfg.queue.max_concurrency, 5);
        assert_eq!(cfg.queue.processing_timeout_ms, 30_000);
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.lock.speaker_lock_timeout_ms, 15_000);
        // Deadlock timeout defaults to 2× the speaker lock timeout.
        assert_eq!(cfg.lock.deadlock_timeout_ms, 2 * cfg.lock.speaker_lock_timeout_ms);
        assert!(cfg.lock.deadlock_detection_enabled);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.reset_timeout_ms, 60_000);
        assert_eq!(cfg.gate.buffer_capacity, 100);
        assert!(cfg.recovery.graceful_degradation_enabled);
    }

    /// Verify that modified non-default values survive a round trip.
    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = GateConfig::default();
        cfg.queue.max_concurrency = 12;
        cfg.queue.max_attempts = 5;
        cfg.lock.speaker_lock_timeout_ms = 5_000;
        cfg.lock.deadlock_detection_enabled = false;
        cfg.breaker.failure_threshold = 3;
        cfg.gate.buffer_capacity = 8;
        cfg.recovery.graceful_degradation_enabled = false;

        cfg.save_to(&path).expect("save");
        let loaded = GateConfig::load_from(&path).expect("load");

        assert_eq!(loaded, cfg);
    }

    /// Missing sections in the TOML fall back to their defaults.
    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("partial.toml");

        std::fs::write(&path, "[queue]\nmax_concurrency = 2\nprocessing_timeout_ms = 1000\nmax_attempts = 1\nretry_base_delay_ms = 50\nretry_max_delay_ms = 500\n").unwrap();

        let loaded = GateConfig::load_from(&path).expect("load");
        assert_eq!(loaded.queue.max_concurrency, 2);
        assert_eq!(loaded.lock, LockSection::default());
        assert_eq!(loaded.breaker, BreakerSection::default());
    }

    /// Duration helpers convert milliseconds faithfully.
    #[test]
    fn duration_helpers() {
        let cfg = GateConfig::default();
        assert_eq!(cfg.queue.processing_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.lock.speaker_lock_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.breaker.reset_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.recovery.overload_retry_delay(), Duration::from_secs(2));
    }
}
