use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cmx_core::CallPhase;

/// Default number of parallel circuits per call.
pub const DEFAULT_NUM_CIRCUITS: usize = 3;

/// Tunables for the multipath circuit scheduler.
///
/// Every field has a serde default, so a config file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_num_circuits")]
    pub num_circuits: usize,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub phases: PhaseConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub rebuild: RebuildConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_circuits: DEFAULT_NUM_CIRCUITS,
            selection: SelectionConfig::default(),
            phases: PhaseConfig::default(),
            cooldown: CooldownConfig::default(),
            rebuild: RebuildConfig::default(),
        }
    }
}

fn default_num_circuits() -> usize {
    DEFAULT_NUM_CIRCUITS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Consecutive frames sent on one circuit before reselecting.
    pub burst_size: u32,
    /// Base weights by health rank, best first. Ranks past the end get 0.
    pub rank_weights: Vec<f64>,
    /// Ramp weight assigned after cooldown, rescue or quarantine release.
    pub min_circuit_weight: f64,
    /// Fixed RNG seed for reproducible selection. Entropy-seeded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            burst_size: 4,
            rank_weights: vec![0.70, 0.20, 0.10],
            min_circuit_weight: 0.05,
            seed: None,
        }
    }
}

/// Phase boundaries, measured from call start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub establishment_ms: u64,
    pub warmup_ms: u64,
    pub relaxed_ms: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            establishment_ms: 3_000,
            warmup_ms: 15_000,
            relaxed_ms: 45_000,
        }
    }
}

impl PhaseConfig {
    /// Phase for a given time since call start.
    pub fn phase_at(&self, elapsed: Duration) -> CallPhase {
        let ms = elapsed.as_millis();
        if ms < u128::from(self.establishment_ms) {
            CallPhase::Establishment
        } else if ms < u128::from(self.warmup_ms) {
            CallPhase::Warmup
        } else if ms < u128::from(self.relaxed_ms) {
            CallPhase::Relaxed
        } else {
            CallPhase::Strict
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub duration_ms: u64,
    /// Consecutive send failures that trigger a cooldown.
    pub send_failure_threshold: u32,
    /// Minimum received (and sent) frames before a circuit is judged.
    pub min_frames_for_evaluation: u64,
    pub relaxed_missing_percent: f64,
    pub relaxed_plc_percent: f64,
    pub strict_missing_percent: f64,
    pub strict_plc_percent: f64,
    /// Delivery-rate floor (0.0-1.0) in the relaxed phase.
    pub relaxed_delivery_rate: f64,
    /// Delivery-rate floor (0.0-1.0) in the strict phase.
    pub strict_delivery_rate: f64,
    /// Consecutive bad-delivery windows that trigger a cooldown on their own.
    pub bad_delivery_windows: u32,
    /// PLC% above which a single bad-delivery window triggers a cooldown.
    pub delivery_plc_gate: f64,
    pub clean_missing_percent: f64,
    pub clean_plc_percent: f64,
    pub clean_late_percent: f64,
    /// Consecutive clean windows before the ramp weight grows.
    pub clean_windows_to_ramp: u32,
    pub ramp_factor: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            duration_ms: 8_000,
            send_failure_threshold: 3,
            min_frames_for_evaluation: 30,
            relaxed_missing_percent: 15.0,
            relaxed_plc_percent: 10.0,
            strict_missing_percent: 5.0,
            strict_plc_percent: 5.0,
            relaxed_delivery_rate: 0.85,
            strict_delivery_rate: 0.92,
            bad_delivery_windows: 2,
            delivery_plc_gate: 3.0,
            clean_missing_percent: 2.0,
            clean_plc_percent: 3.0,
            clean_late_percent: 5.0,
            clean_windows_to_ramp: 2,
            ramp_factor: 1.5,
        }
    }
}

impl CooldownConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// `(missing%, plc%)` thresholds for a phase, or `None` when the phase
    /// runs no quality checks.
    pub fn quality_thresholds(&self, phase: CallPhase) -> Option<(f64, f64)> {
        match phase {
            CallPhase::Relaxed => Some((self.relaxed_missing_percent, self.relaxed_plc_percent)),
            CallPhase::Strict => Some((self.strict_missing_percent, self.strict_plc_percent)),
            CallPhase::Establishment | CallPhase::Warmup => None,
        }
    }

    pub fn delivery_threshold(&self, phase: CallPhase) -> Option<f64> {
        match phase {
            CallPhase::Relaxed => Some(self.relaxed_delivery_rate),
            CallPhase::Strict => Some(self.strict_delivery_rate),
            CallPhase::Establishment | CallPhase::Warmup => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// PLC% at or above which a window is bad on its own.
    pub severe_plc_percent: f64,
    /// PLC% that, combined with `combined_missing_percent`, makes a window bad.
    pub combined_plc_percent: f64,
    pub combined_missing_percent: f64,
    /// PLC% that makes a window bad when local playout is not the cause.
    pub network_plc_percent: f64,
    /// Late-to-buffer rate below which concealment is blamed on the network.
    pub network_late_to_buffer_percent: f64,
    pub bad_windows_to_quarantine: u32,
    /// Bad windows still counted at quarantine expiry that escalate to a rebuild.
    pub bad_windows_to_rebuild: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Run rebuild evaluation from each feedback cycle.
    pub evaluate_on_feedback: bool,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            severe_plc_percent: 12.0,
            combined_plc_percent: 8.0,
            combined_missing_percent: 5.0,
            network_plc_percent: 10.0,
            network_late_to_buffer_percent: 1.0,
            bad_windows_to_quarantine: 3,
            bad_windows_to_rebuild: 2,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 60_000,
            evaluate_on_feedback: true,
        }
    }
}

impl SchedulerConfig {
    /// Default config with a different circuit count.
    pub fn with_circuits(num_circuits: usize) -> Self {
        Self {
            num_circuits,
            ..Self::default()
        }
    }

    /// Load config from an explicit TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scheduler config: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse scheduler config: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Load the user-level config, or defaults when it does not exist or the
    /// config directory cannot be determined (e.g. no HOME in containers).
    pub fn load_or_default() -> Result<Self> {
        match Self::user_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                tracing::debug!("No user scheduler config found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Path to the user-level config: `~/.config/circuit-mux/config.toml`.
    pub fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "circuit-mux")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write scheduler config: {}", path.display()))?;
        Ok(())
    }

    /// Generate a default config TOML with comments as a template.
    pub fn default_template() -> String {
        r#"# circuit-mux scheduler configuration
# Location: ~/.config/circuit-mux/config.toml
#
# Every value below is the built-in default. Remove lines you do not change.

num_circuits = 3

[selection]
burst_size = 4                    # frames per circuit before reselecting
rank_weights = [0.70, 0.20, 0.10] # best, second, third
min_circuit_weight = 0.05         # ramp weight after cooldown/rescue
# seed = 42                       # deterministic selection (testing only)

[phases]
establishment_ms = 3000  # equal probing
warmup_ms = 15000        # metrics only, no cooldowns
relaxed_ms = 45000       # relaxed thresholds; strict afterwards

[cooldown]
duration_ms = 8000
send_failure_threshold = 3
min_frames_for_evaluation = 30
relaxed_missing_percent = 15.0
relaxed_plc_percent = 10.0
strict_missing_percent = 5.0
strict_plc_percent = 5.0
relaxed_delivery_rate = 0.85
strict_delivery_rate = 0.92
bad_delivery_windows = 2
delivery_plc_gate = 3.0
clean_missing_percent = 2.0
clean_plc_percent = 3.0
clean_late_percent = 5.0
clean_windows_to_ramp = 2
ramp_factor = 1.5

[rebuild]
severe_plc_percent = 12.0
combined_plc_percent = 8.0
combined_missing_percent = 5.0
network_plc_percent = 10.0
network_late_to_buffer_percent = 1.0
bad_windows_to_quarantine = 3
bad_windows_to_rebuild = 2
initial_backoff_ms = 10000
max_backoff_ms = 60000
evaluate_on_feedback = true
"#
        .to_string()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
