use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{TangleError, TangleResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_input_queue_capacity")]
    pub input_queue_capacity: usize,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default = "default_state_reader_cache_capacity")]
    pub state_reader_cache_capacity: usize,
    #[serde(default)]
    pub ledger: LedgerParams,
}

fn default_input_queue_capacity() -> usize {
    4_096
}

fn default_dedup_window() -> usize {
    1_024
}

fn default_state_reader_cache_capacity() -> usize {
    10
}

impl NodeConfig {
    pub fn load(path: &Path) -> TangleResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| TangleError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> TangleResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| TangleError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> TangleResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            input_queue_capacity: default_input_queue_capacity(),
            dedup_window: default_dedup_window(),
            state_reader_cache_capacity: default_state_reader_cache_capacity(),
            ledger: LedgerParams::default(),
        }
    }
}

/// Ledger-wide constants. A single instance is constructed at node init and
/// passed explicitly through the environment; all peers of a network must run
/// with identical values for deterministic coverage and root records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerParams {
    pub slot_duration_ms: u64,
    pub initial_supply: u64,
    /// Ledger coverage decays by this right-shift per slot of gap between a
    /// branch and its baseline.
    pub coverage_ageing_shift: u32,
    pub pull_loop_period_ms: u64,
    pub pull_repeat_period_ms: u64,
    /// After this many repull periods without an answer the pull escalates
    /// from one random peer to all peers.
    pub pull_stuck_after_periods: u32,
    /// A vertex unreferenced for longer than this many slots is reclaimed by
    /// the next prune sweep.
    pub prune_grace_slots: u32,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            slot_duration_ms: 10_000,
            initial_supply: 1_000_000_000,
            coverage_ageing_shift: 1,
            pull_loop_period_ms: 50,
            pull_repeat_period_ms: 500,
            pull_stuck_after_periods: 10,
            prune_grace_slots: 1,
        }
    }
}

impl LedgerParams {
    pub fn slot_duration(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms)
    }

    pub fn prune_loop_period(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms / 2)
    }

    pub fn prune_grace(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms * u64::from(self.prune_grace_slots))
    }

    pub fn pull_loop_period(&self) -> Duration {
        Duration::from_millis(self.pull_loop_period_ms)
    }

    pub fn pull_repeat_period(&self) -> Duration {
        Duration::from_millis(self.pull_repeat_period_ms)
    }

    pub fn pull_stuck_after(&self) -> Duration {
        self.pull_repeat_period() * self.pull_stuck_after_periods
    }

    /// Ages a coverage value across a slot gap.
    pub fn age_coverage(&self, coverage: u64, slot_gap: u32) -> u64 {
        let shift = self
            .coverage_ageing_shift
            .saturating_mul(slot_gap)
            .min(u64::BITS - 1);
        coverage >> shift
    }
}
