use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable position of a circuit for the lifetime of a call (`0..num_circuits`).
pub type CircuitIndex = usize;

/// Stage of a call, derived from the time elapsed since the call started.
///
/// Phases are ordered: `Establishment < Warmup < Relaxed < Strict`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallPhase {
    /// Equal probing across all circuits; health is ignored for selection.
    Establishment,
    /// Soft steering via scores only; no cooldowns, ramp-up or rebuilds.
    Warmup,
    /// Relaxed quality thresholds.
    Relaxed,
    /// Strict quality thresholds.
    Strict,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Establishment => "establishment",
            Self::Warmup => "warmup",
            Self::Relaxed => "relaxed",
            Self::Strict => "strict",
        }
    }

    /// Whether the network has had time to settle, so that quality-driven
    /// policies (cooldown, ramp-up, rebuild) may run.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Relaxed | Self::Strict)
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a circuit was last placed into cooldown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CooldownReason {
    /// Consecutive local send failures reached the threshold.
    SendFailure,
    /// Peer-confirmed delivery rate stayed below the phase threshold.
    DeliveryRate,
    /// Receiver-reported missing frames above the phase threshold.
    HighMissing,
    /// Receiver-reported concealment above the phase threshold.
    HighPlc,
}

impl CooldownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendFailure => "send-failure",
            Self::DeliveryRate => "delivery-rate",
            Self::HighMissing => "high-missing",
            Self::HighPlc => "high-plc",
        }
    }
}

impl std::fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-circuit quality report from the receiving peer.
///
/// Values are absolute for the reporting window, never deltas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitFeedback {
    pub late_percent: f64,
    pub missing_percent: f64,
    pub plc_percent: f64,
    /// Total frames the peer has received on this circuit.
    pub frames_received: u64,
}

impl CircuitFeedback {
    /// Feedback carrying only a late-frame percentage (older peers).
    pub fn late_only(late_percent: f64) -> Self {
        Self {
            late_percent,
            ..Self::default()
        }
    }
}

/// Read-only per-circuit snapshot for observability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub circuit_index: CircuitIndex,
    pub late_frame_percent: f64,
    pub send_failures: u32,
    pub total_frames_sent: u64,
    pub in_cooldown: bool,
}

/// Identity of one call; scheduler instances never outlive it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Ulid);

impl CallId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag identifying one rebuild attempt of one circuit within one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RebuildTicket {
    pub call_id: CallId,
    pub circuit: CircuitIndex,
    pub epoch: u32,
}

/// Result of an externally performed circuit close + reopen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildOutcome {
    Rebuilt,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}
