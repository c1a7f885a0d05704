//! Per-circuit health record.
//!
//! Only [`CircuitScheduler`](crate::CircuitScheduler) mutates these; callers
//! get read-only views through snapshots.

use serde::Serialize;
use std::time::Instant;

use cmx_core::{CircuitFeedback, CircuitIndex, CircuitStats, CooldownReason};

/// Penalty coefficients for the health score (lower score = healthier).
const LATE_PENALTY: f64 = 0.5;
const MISSING_PENALTY: f64 = 1.5;
const PLC_PENALTY: f64 = 2.0;
const SEND_FAILURE_PENALTY: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitHealth {
    /// Consecutive local send failures since the last success.
    pub send_failures: u32,
    pub late_frame_percent: f64,
    pub missing_frame_percent: f64,
    pub plc_percent: f64,
    /// Frames sent on this circuit over the whole call. Monotonic.
    pub total_frames_sent: u64,
    /// `total_frames_sent` when the current rebuild epoch started.
    pub epoch_sent_baseline: u64,
    /// Last absolute received count reported by the peer.
    pub peer_frames_received: u64,
    pub cooldown_until: Option<Instant>,
    /// Selection-weight multiplier in `[0, 1]`.
    pub ramp_up_weight: f64,
    pub clean_windows_count: u32,
    pub bad_windows_count: u32,
    pub bad_delivery_windows: u32,
    pub quarantine_until: Option<Instant>,
    pub is_rebuild_candidate: bool,
    /// A rebuild request for this circuit is awaiting completion.
    pub rebuilding: bool,
    /// Playout-reported share of frames that missed their deadline locally.
    pub late_to_buffer_percent: f64,
    pub rebuild_failures: u32,
    pub rebuild_backoff_ms: u64,
    pub rebuild_epoch: u32,
    pub last_cooldown_reason: Option<CooldownReason>,
}

impl CircuitHealth {
    pub fn new(initial_backoff_ms: u64) -> Self {
        Self {
            send_failures: 0,
            late_frame_percent: 0.0,
            missing_frame_percent: 0.0,
            plc_percent: 0.0,
            total_frames_sent: 0,
            epoch_sent_baseline: 0,
            peer_frames_received: 0,
            cooldown_until: None,
            ramp_up_weight: 1.0,
            clean_windows_count: 0,
            bad_windows_count: 0,
            bad_delivery_windows: 0,
            quarantine_until: None,
            is_rebuild_candidate: false,
            rebuilding: false,
            late_to_buffer_percent: 0.0,
            rebuild_failures: 0,
            rebuild_backoff_ms: initial_backoff_ms,
            rebuild_epoch: 0,
            last_cooldown_reason: None,
        }
    }

    /// Weighted penalty sum. A perfect circuit scores 0.
    ///
    /// Loss and audible concealment weigh far more than lateness; local send
    /// failures are a strong, cheap signal.
    pub fn score(&self) -> f64 {
        self.late_frame_percent * LATE_PENALTY
            + self.missing_frame_percent * MISSING_PENALTY
            + self.plc_percent * PLC_PENALTY
            + f64::from(self.send_failures) * SEND_FAILURE_PENALTY
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Quarantined or mid-rebuild: weight is pinned at zero by the rebuild policy.
    pub fn is_held(&self) -> bool {
        self.is_rebuild_candidate || self.rebuilding
    }

    /// Eligible for normal weighted selection.
    pub fn is_selectable(&self, now: Instant) -> bool {
        !self.in_cooldown(now) && self.ramp_up_weight > 0.0
    }

    /// Frames sent since the current rebuild epoch started.
    pub fn epoch_frames_sent(&self) -> u64 {
        self.total_frames_sent.saturating_sub(self.epoch_sent_baseline)
    }

    /// Peer-confirmed delivery ratio (0.0-1.0) for the current epoch, or
    /// `None` until at least `min_frames` were sent.
    pub fn delivery_rate(&self, min_frames: u64) -> Option<f64> {
        let sent = self.epoch_frames_sent();
        if sent < min_frames || sent == 0 {
            return None;
        }
        Some(self.peer_frames_received as f64 / sent as f64)
    }

    /// Replace receiver-reported metrics wholesale.
    pub fn apply_feedback(&mut self, feedback: &CircuitFeedback) {
        self.late_frame_percent = feedback.late_percent;
        self.missing_frame_percent = feedback.missing_percent;
        self.plc_percent = feedback.plc_percent;
        self.peer_frames_received = feedback.frames_received;
    }

    /// Start a fresh delivery accounting epoch after a rebuild.
    pub fn reset_delivery_epoch(&mut self) {
        self.epoch_sent_baseline = self.total_frames_sent;
        self.peer_frames_received = 0;
        self.bad_delivery_windows = 0;
    }

    pub fn stats(&self, circuit_index: CircuitIndex, now: Instant) -> CircuitStats {
        CircuitStats {
            circuit_index,
            late_frame_percent: self.late_frame_percent,
            send_failures: self.send_failures,
            total_frames_sent: self.total_frames_sent,
            in_cooldown: self.in_cooldown(now),
        }
    }

    pub fn snapshot(
        &self,
        circuit_index: CircuitIndex,
        now: Instant,
        min_frames: u64,
    ) -> CircuitHealthSnapshot {
        CircuitHealthSnapshot {
            circuit_index,
            score: self.score(),
            late_frame_percent: self.late_frame_percent,
            missing_frame_percent: self.missing_frame_percent,
            plc_percent: self.plc_percent,
            ramp_up_weight: self.ramp_up_weight,
            in_cooldown: self.in_cooldown(now),
            last_cooldown_reason: self.last_cooldown_reason,
            quarantined: self.is_rebuild_candidate,
            rebuilding: self.rebuilding,
            rebuild_epoch: self.rebuild_epoch,
            rebuild_failures: self.rebuild_failures,
            rebuild_backoff_ms: self.rebuild_backoff_ms,
            send_failures: self.send_failures,
            total_frames_sent: self.total_frames_sent,
            peer_frames_received: self.peer_frames_received,
            delivery_rate: self.delivery_rate(min_frames),
        }
    }
}

/// Extended read-only view of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitHealthSnapshot {
    pub circuit_index: CircuitIndex,
    pub score: f64,
    pub late_frame_percent: f64,
    pub missing_frame_percent: f64,
    pub plc_percent: f64,
    pub ramp_up_weight: f64,
    pub in_cooldown: bool,
    pub last_cooldown_reason: Option<CooldownReason>,
    pub quarantined: bool,
    pub rebuilding: bool,
    pub rebuild_epoch: u32,
    pub rebuild_failures: u32,
    pub rebuild_backoff_ms: u64,
    pub send_failures: u32,
    pub total_frames_sent: u64,
    pub peer_frames_received: u64,
    pub delivery_rate: Option<f64>,
}
