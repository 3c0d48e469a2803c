use std::path::PathBuf;
use std::time::Duration;

use crate::calendar::SlotOverlapPolicy;

/// Runtime settings, read from `SLOTGUARD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bound on the provider-lock wait. `None` waits indefinitely.
    pub lock_wait: Option<Duration>,
    /// How often a booking re-runs after a repository conflict before giving up.
    pub max_conflict_retries: u32,
    pub slot_overlap: SlotOverlapPolicy,
    /// WAL-backed repository when set, in-memory otherwise.
    pub data_dir: Option<PathBuf>,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_wait: Some(Duration::from_secs(5)),
            max_conflict_retries: 3,
            slot_overlap: SlotOverlapPolicy::Reject,
            data_dir: None,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let lock_wait = match parse("SLOTGUARD_LOCK_WAIT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.lock_wait,
        };
        let slot_overlap = lookup("SLOTGUARD_SLOT_OVERLAP")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.slot_overlap);

        Self {
            lock_wait,
            max_conflict_retries: parse("SLOTGUARD_CONFLICT_RETRIES")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_conflict_retries),
            slot_overlap,
            data_dir: lookup("SLOTGUARD_DATA_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            compact_threshold: parse("SLOTGUARD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("SLOTGUARD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        }
    }
}
