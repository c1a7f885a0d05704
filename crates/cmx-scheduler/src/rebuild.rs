//! Quarantine -> replace -> ramp for durably bad circuits.
//!
//! Cooldown absorbs transient blips. A circuit that stays bad across several
//! evaluation windows is first quarantined (zero weight, kept open), then
//! either released or torn down and reconnected once the quarantine expires.
//! Which circuit may rebuild is decided by the scheduler, which owns the
//! single in-flight rebuild slot.

use std::time::{Duration, Instant};

use cmx_config::RebuildConfig;

use crate::health::CircuitHealth;

/// What to do with a quarantined circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineVerdict {
    /// Not quarantined, or the quarantine has not expired yet.
    Pending,
    /// Recovered while quarantined; release at minimum weight.
    Release,
    /// Still bad after quarantine; tear down and reconnect.
    Rebuild,
}

#[derive(Debug, Clone)]
pub struct RebuildPolicy {
    config: RebuildConfig,
    min_weight: f64,
}

impl RebuildPolicy {
    pub fn new(config: RebuildConfig, min_weight: f64) -> Self {
        Self { config, min_weight }
    }

    pub fn config(&self) -> &RebuildConfig {
        &self.config
    }

    /// A window is bad on severe concealment, concealment with loss, or
    /// concealment that local playout lateness does not explain.
    pub fn is_bad_window(&self, health: &CircuitHealth, late_to_buffer_percent: f64) -> bool {
        let plc = health.plc_percent;
        let missing = health.missing_frame_percent;
        let c = &self.config;
        plc >= c.severe_plc_percent
            || (plc >= c.combined_plc_percent && missing >= c.combined_missing_percent)
            || (plc >= c.network_plc_percent
                && late_to_buffer_percent < c.network_late_to_buffer_percent)
    }

    /// Count one window; good windows reset the streak. Returns `true` when
    /// the streak is long enough to quarantine.
    pub fn record_window(&self, health: &mut CircuitHealth, bad: bool) -> bool {
        if bad {
            health.bad_windows_count = health.bad_windows_count.saturating_add(1);
        } else {
            health.bad_windows_count = 0;
        }
        health.bad_windows_count >= self.config.bad_windows_to_quarantine
    }

    /// Zero the weight and hold the circuit for its current backoff.
    /// Returns the hold duration.
    pub fn quarantine(&self, health: &mut CircuitHealth, now: Instant) -> Duration {
        let hold = Duration::from_millis(health.rebuild_backoff_ms);
        health.quarantine_until = Some(now + hold);
        health.ramp_up_weight = 0.0;
        health.is_rebuild_candidate = true;
        hold
    }

    pub fn verdict(&self, health: &CircuitHealth, now: Instant) -> QuarantineVerdict {
        if !health.is_rebuild_candidate {
            return QuarantineVerdict::Pending;
        }
        match health.quarantine_until {
            Some(until) if now < until => QuarantineVerdict::Pending,
            _ if health.bad_windows_count >= self.config.bad_windows_to_rebuild => {
                QuarantineVerdict::Rebuild
            }
            _ => QuarantineVerdict::Release,
        }
    }

    /// Return a recovered circuit to normal scheduling at minimum weight.
    pub fn release(&self, health: &mut CircuitHealth) {
        health.ramp_up_weight = self.min_weight;
        health.clean_windows_count = 0;
        health.is_rebuild_candidate = false;
        health.bad_windows_count = 0;
        health.quarantine_until = None;
    }

    /// Mark a rebuild as started and return its epoch. Weight stays at zero
    /// until the rebuild completes.
    pub fn begin(&self, health: &mut CircuitHealth) -> u32 {
        health.rebuild_epoch = health.rebuild_epoch.wrapping_add(1);
        health.rebuilding = true;
        health.is_rebuild_candidate = false;
        health.quarantine_until = None;
        health.bad_windows_count = 0;
        health.ramp_up_weight = 0.0;
        health.clean_windows_count = 0;
        health.send_failures = 0;
        health.bad_delivery_windows = 0;
        health.rebuild_epoch
    }

    /// The new path is up: reset backoff and start a fresh delivery epoch at
    /// minimum weight.
    pub fn complete(&self, health: &mut CircuitHealth) {
        health.rebuilding = false;
        health.rebuild_failures = 0;
        health.rebuild_backoff_ms = self.config.initial_backoff_ms;
        health.ramp_up_weight = self.min_weight;
        health.clean_windows_count = 0;
        health.bad_windows_count = 0;
        health.reset_delivery_epoch();
    }

    /// The reconnect failed: double the backoff (capped) and quarantine again
    /// for that long, with a clean bad-window count. The circuit is rebuilt
    /// again at expiry only if it keeps failing windows meanwhile.
    pub fn fail(&self, health: &mut CircuitHealth, now: Instant) {
        health.rebuilding = false;
        health.rebuild_failures = health.rebuild_failures.saturating_add(1);
        health.rebuild_backoff_ms = health
            .rebuild_backoff_ms
            .saturating_mul(2)
            .min(self.config.max_backoff_ms);
        health.bad_windows_count = 0;
        self.quarantine(health, now);
    }
}
