//! Temporary exclusion of a misbehaving circuit, followed by a slow ramp back.
//!
//! A cooldown never retires a circuit: it suppresses selection for a bounded
//! window and then forces the circuit to earn its weight back through
//! consecutive clean feedback windows.

use std::time::Instant;
use tracing::debug;

use cmx_config::CooldownConfig;
use cmx_core::{CallPhase, CooldownReason};

use crate::health::CircuitHealth;

#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    config: CooldownConfig,
    min_weight: f64,
}

impl CooldownPolicy {
    pub fn new(config: CooldownConfig, min_weight: f64) -> Self {
        Self { config, min_weight }
    }

    pub fn config(&self) -> &CooldownConfig {
        &self.config
    }

    /// Exclude the circuit until `now + duration` and restart its ramp.
    ///
    /// A quarantined or rebuilding circuit keeps its zero weight; the rebuild
    /// policy owns it until release.
    pub fn trigger(&self, health: &mut CircuitHealth, reason: CooldownReason, now: Instant) {
        health.cooldown_until = Some(now + self.config.duration());
        if !health.is_held() {
            health.ramp_up_weight = self.min_weight;
        }
        health.clean_windows_count = 0;
        health.bad_delivery_windows = 0;
        health.last_cooldown_reason = Some(reason);
    }

    /// Count one local send failure. Returns `true` when the threshold is
    /// reached; the counter is reset so the next failure starts a new count.
    pub fn record_send_failure(&self, health: &mut CircuitHealth) -> bool {
        health.send_failures = health.send_failures.saturating_add(1);
        if health.send_failures >= self.config.send_failure_threshold {
            health.send_failures = 0;
            return true;
        }
        false
    }

    /// Judge one feedback window. At most one reason is returned; missing
    /// frames take precedence over concealment, and both over delivery rate.
    ///
    /// The delivery check only runs (and only moves its persistence counter)
    /// when neither quality threshold fired.
    pub fn evaluate(&self, health: &mut CircuitHealth, phase: CallPhase) -> Option<CooldownReason> {
        let (missing_threshold, plc_threshold) = self.config.quality_thresholds(phase)?;

        if health.missing_frame_percent > missing_threshold {
            return Some(CooldownReason::HighMissing);
        }
        if health.plc_percent > plc_threshold {
            return Some(CooldownReason::HighPlc);
        }
        if self.delivery_cooldown_due(health, phase) {
            return Some(CooldownReason::DeliveryRate);
        }
        None
    }

    /// Persistence + audibility gate for delivery-rate cooldowns: fire on
    /// repeated bad windows, or on a single one when concealment is audible.
    fn delivery_cooldown_due(&self, health: &mut CircuitHealth, phase: CallPhase) -> bool {
        let Some(threshold) = self.config.delivery_threshold(phase) else {
            return false;
        };
        let Some(rate) = health.delivery_rate(self.config.min_frames_for_evaluation) else {
            return false;
        };

        if rate >= threshold {
            health.bad_delivery_windows = 0;
            return false;
        }

        health.bad_delivery_windows = health.bad_delivery_windows.saturating_add(1);
        let persistent = health.bad_delivery_windows >= self.config.bad_delivery_windows;
        let audible = health.plc_percent > self.config.delivery_plc_gate;
        debug!(
            delivery = rate * 100.0,
            threshold = threshold * 100.0,
            bad_windows = health.bad_delivery_windows,
            persistent,
            audible,
            "Delivery rate below threshold"
        );
        persistent || audible
    }

    pub fn is_clean_window(&self, health: &CircuitHealth) -> bool {
        health.missing_frame_percent < self.config.clean_missing_percent
            && health.plc_percent < self.config.clean_plc_percent
            && health.late_frame_percent < self.config.clean_late_percent
    }

    /// Advance the ramp after one feedback window. Returns `true` when the
    /// weight grew. A dirty window resets the streak but keeps the weight.
    pub fn update_ramp_up(&self, health: &mut CircuitHealth) -> bool {
        if health.ramp_up_weight >= 1.0 {
            return false;
        }

        if !self.is_clean_window(health) {
            health.clean_windows_count = 0;
            return false;
        }

        health.clean_windows_count = health.clean_windows_count.saturating_add(1);
        if health.clean_windows_count < self.config.clean_windows_to_ramp {
            return false;
        }
        health.ramp_up_weight = (health.ramp_up_weight * self.config.ramp_factor).min(1.0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> CooldownPolicy {
        CooldownPolicy::new(CooldownConfig::default(), 0.05)
    }

    fn health_with(missing: f64, plc: f64, late: f64) -> CircuitHealth {
        let mut health = CircuitHealth::new(10_000);
        health.missing_frame_percent = missing;
        health.plc_percent = plc;
        health.late_frame_percent = late;
        health
    }

    #[test]
    fn test_trigger_sets_window_and_weight() {
        let now = Instant::now();
        let mut health = health_with(0.0, 0.0, 0.0);
        health.clean_windows_count = 3;
        health.bad_delivery_windows = 1;

        policy().trigger(&mut health, CooldownReason::HighPlc, now);

        assert_eq!(health.cooldown_until, Some(now + Duration::from_millis(8_000)));
        assert_eq!(health.ramp_up_weight, 0.05);
        assert_eq!(health.clean_windows_count, 0);
        assert_eq!(health.bad_delivery_windows, 0);
        assert_eq!(health.last_cooldown_reason, Some(CooldownReason::HighPlc));
    }

    #[test]
    fn test_trigger_keeps_quarantine_weight() {
        let mut health = health_with(0.0, 0.0, 0.0);
        health.is_rebuild_candidate = true;
        health.ramp_up_weight = 0.0;
        policy().trigger(&mut health, CooldownReason::HighMissing, Instant::now());
        assert_eq!(health.ramp_up_weight, 0.0);
    }

    #[test]
    fn test_send_failure_threshold() {
        let policy = policy();
        let mut health = health_with(0.0, 0.0, 0.0);
        assert!(!policy.record_send_failure(&mut health));
        assert!(!policy.record_send_failure(&mut health));
        assert!(policy.record_send_failure(&mut health));
        assert_eq!(health.send_failures, 0);
    }

    #[test]
    fn test_no_evaluation_before_settled() {
        let policy = policy();
        let mut health = health_with(50.0, 50.0, 50.0);
        assert_eq!(policy.evaluate(&mut health, CallPhase::Establishment), None);
        assert_eq!(policy.evaluate(&mut health, CallPhase::Warmup), None);
    }

    #[test]
    fn test_phase_thresholds() {
        let policy = policy();
        let mut health = health_with(10.0, 0.0, 0.0);
        assert_eq!(policy.evaluate(&mut health, CallPhase::Relaxed), None);
        assert_eq!(
            policy.evaluate(&mut health, CallPhase::Strict),
            Some(CooldownReason::HighMissing)
        );

        let mut health = health_with(0.0, 7.0, 0.0);
        assert_eq!(policy.evaluate(&mut health, CallPhase::Relaxed), None);
        assert_eq!(
            policy.evaluate(&mut health, CallPhase::Strict),
            Some(CooldownReason::HighPlc)
        );
    }

    #[test]
    fn test_missing_takes_precedence_over_plc() {
        let mut health = health_with(20.0, 20.0, 0.0);
        assert_eq!(
            policy().evaluate(&mut health, CallPhase::Strict),
            Some(CooldownReason::HighMissing)
        );
    }

    #[test]
    fn test_delivery_requires_persistence_without_audible_plc() {
        let policy = policy();
        let mut health = health_with(0.0, 1.0, 0.0);
        health.total_frames_sent = 100;
        health.peer_frames_received = 80;

        assert_eq!(policy.evaluate(&mut health, CallPhase::Strict), None);
        assert_eq!(health.bad_delivery_windows, 1);
        assert_eq!(
            policy.evaluate(&mut health, CallPhase::Strict),
            Some(CooldownReason::DeliveryRate)
        );
    }

    #[test]
    fn test_delivery_fires_immediately_with_audible_plc() {
        let mut health = health_with(0.0, 4.0, 0.0);
        health.total_frames_sent = 100;
        health.peer_frames_received = 80;
        assert_eq!(
            policy().evaluate(&mut health, CallPhase::Strict),
            Some(CooldownReason::DeliveryRate)
        );
    }

    #[test]
    fn test_good_delivery_resets_counter() {
        let policy = policy();
        let mut health = health_with(0.0, 0.0, 0.0);
        health.total_frames_sent = 100;
        health.peer_frames_received = 80;
        policy.evaluate(&mut health, CallPhase::Strict);
        assert_eq!(health.bad_delivery_windows, 1);

        health.peer_frames_received = 99;
        assert_eq!(policy.evaluate(&mut health, CallPhase::Strict), None);
        assert_eq!(health.bad_delivery_windows, 0);
    }

    #[test]
    fn test_relaxed_delivery_threshold_is_looser() {
        let mut health = health_with(0.0, 4.0, 0.0);
        health.total_frames_sent = 100;
        health.peer_frames_received = 88;
        assert_eq!(policy().evaluate(&mut health, CallPhase::Relaxed), None);
    }

    #[test]
    fn test_ramp_needs_two_clean_windows() {
        let policy = policy();
        let mut health = health_with(0.0, 0.0, 0.0);
        health.ramp_up_weight = 0.05;

        assert!(!policy.update_ramp_up(&mut health));
        assert_eq!(health.ramp_up_weight, 0.05);
        assert!(policy.update_ramp_up(&mut health));
        assert!((health.ramp_up_weight - 0.075).abs() < 1e-12);
        assert!(policy.update_ramp_up(&mut health));
        assert!((health.ramp_up_weight - 0.1125).abs() < 1e-12);
    }

    #[test]
    fn test_dirty_window_resets_streak_not_weight() {
        let policy = policy();
        let mut health = health_with(0.0, 0.0, 0.0);
        health.ramp_up_weight = 0.2;
        policy.update_ramp_up(&mut health);
        assert_eq!(health.clean_windows_count, 1);

        health.late_frame_percent = 6.0;
        assert!(!policy.update_ramp_up(&mut health));
        assert_eq!(health.clean_windows_count, 0);
        assert_eq!(health.ramp_up_weight, 0.2);
    }

    #[test]
    fn test_ramp_caps_at_one() {
        let policy = policy();
        let mut health = health_with(0.0, 0.0, 0.0);
        health.ramp_up_weight = 0.05;
        let mut previous = health.ramp_up_weight;
        for _ in 0..40 {
            policy.update_ramp_up(&mut health);
            assert!(health.ramp_up_weight >= previous);
            assert!(health.ramp_up_weight <= 1.0);
            previous = health.ramp_up_weight;
        }
        assert_eq!(health.ramp_up_weight, 1.0);
    }
}
