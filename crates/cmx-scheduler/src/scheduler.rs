//! Single-owner circuit scheduler for one call.
//!
//! Every method takes `&mut self`; concurrent callers go through
//! [`SharedScheduler`](crate::SharedScheduler), which serializes access with
//! one lock around the whole health array.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use cmx_config::{SchedulerConfig, validate_config};
use cmx_core::{
    CallId, CallPhase, CircuitFeedback, CircuitIndex, CircuitStats, Clock, CmxError,
    CooldownReason, RebuildOutcome, RebuildTicket, SystemClock,
};

use crate::cooldown::CooldownPolicy;
use crate::health::{CircuitHealth, CircuitHealthSnapshot};
use crate::phase::PhaseClock;
use crate::rebuild::{QuarantineVerdict, RebuildPolicy};
use crate::selection::{Burst, normalized_weights, pick_weighted};
use crate::telemetry::{CircuitEvent, TelemetrySink, TracingTelemetry};

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    call_id: CallId,
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn call_id(mut self, call_id: CallId) -> Self {
        self.call_id = call_id;
        self
    }

    /// Validate the config and start the call clock.
    pub fn build(self) -> Result<CircuitScheduler, CmxError> {
        if self.config.num_circuits == 0 {
            return Err(CmxError::InvalidCircuitCount(0));
        }
        validate_config(&self.config).map_err(|e| CmxError::InvalidConfig(format!("{e:#}")))?;
        Ok(CircuitScheduler::from_parts(
            self.config,
            self.clock,
            self.telemetry,
            self.call_id,
        ))
    }
}

pub struct CircuitScheduler {
    call_id: CallId,
    config: SchedulerConfig,
    health: Vec<CircuitHealth>,
    phase: PhaseClock,
    cooldown: CooldownPolicy,
    rebuild: RebuildPolicy,
    burst: Burst,
    rng: StdRng,
    /// The one rebuild allowed in flight for this call.
    rebuild_in_flight: Option<RebuildTicket>,
    /// Rebuilds started but not yet handed to the transport.
    pending_rebuilds: Vec<RebuildTicket>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for CircuitScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitScheduler")
            .field("call_id", &self.call_id)
            .field("num_circuits", &self.health.len())
            .field("phase", &self.phase.current())
            .field("rebuild_in_flight", &self.rebuild_in_flight)
            .finish()
    }
}

impl Default for CircuitScheduler {
    fn default() -> Self {
        Self::from_parts(
            SchedulerConfig::default(),
            Arc::new(SystemClock),
            Arc::new(TracingTelemetry),
            CallId::new(),
        )
    }
}

impl CircuitScheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(TracingTelemetry),
            call_id: CallId::new(),
        }
    }

    /// Default tunables with `num_circuits` circuits, on the system clock.
    pub fn new(num_circuits: usize) -> Result<Self, CmxError> {
        Self::builder(SchedulerConfig::with_circuits(num_circuits)).build()
    }

    fn from_parts(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
        call_id: CallId,
    ) -> Self {
        let rng = match config.selection.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let min_weight = config.selection.min_circuit_weight;
        let health = (0..config.num_circuits)
            .map(|_| CircuitHealth::new(config.rebuild.initial_backoff_ms))
            .collect();
        Self {
            call_id,
            health,
            phase: PhaseClock::start(clock, config.phases.clone()),
            cooldown: CooldownPolicy::new(config.cooldown.clone(), min_weight),
            rebuild: RebuildPolicy::new(config.rebuild.clone(), min_weight),
            // Primed so the first establishment probe lands on circuit 0.
            burst: Burst {
                circuit: config.num_circuits.saturating_sub(1),
                frames: u32::MAX,
            },
            rng,
            rebuild_in_flight: None,
            pending_rebuilds: Vec::new(),
            telemetry,
            config,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn num_circuits(&self) -> usize {
        self.health.len()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn current_phase(&self) -> CallPhase {
        self.phase.current()
    }

    pub fn call_elapsed(&self) -> Duration {
        self.phase.elapsed()
    }

    pub fn health(&self, circuit: CircuitIndex) -> Option<&CircuitHealth> {
        self.health.get(circuit)
    }

    /// The rebuild currently awaiting completion, if any.
    pub fn rebuild_in_flight(&self) -> Option<RebuildTicket> {
        self.rebuild_in_flight
    }

    fn emit(&self, event: CircuitEvent) {
        self.telemetry.record(&event);
    }

    fn in_range(&self, circuit: CircuitIndex, op: &str) -> bool {
        if circuit < self.health.len() {
            return true;
        }
        warn!(
            circuit,
            count = self.health.len(),
            op,
            "Ignoring out-of-range circuit index"
        );
        false
    }

    fn checked(&self, circuit: CircuitIndex) -> Result<(), CmxError> {
        if circuit < self.health.len() {
            Ok(())
        } else {
            Err(CmxError::CircuitOutOfRange {
                index: circuit,
                count: self.health.len(),
            })
        }
    }

    // ── Selection ──────────────────────────────────────────────────────

    /// Circuit for the next outgoing frame. Never blocks, never fails.
    ///
    /// Frames go out in bursts on one circuit; a burst ends early if its
    /// circuit stops being selectable.
    pub fn select_circuit(&mut self) -> CircuitIndex {
        let now = self.phase.now();

        // Not enough data yet to judge quality: probe every circuit in turn.
        if self.phase.current() == CallPhase::Establishment {
            let probe = (self.burst.circuit + 1) % self.health.len();
            self.burst.restart(probe);
            self.burst.end();
            return probe;
        }

        if !self.health[self.burst.circuit].is_selectable(now) {
            self.burst.end();
        }
        if let Some(circuit) = self.burst.try_continue(self.config.selection.burst_size) {
            return circuit;
        }

        let next = self.select_weighted_circuit(now);
        self.burst.restart(next);
        next
    }

    fn select_weighted_circuit(&mut self, now: Instant) -> CircuitIndex {
        let mut available: Vec<CircuitIndex> = (0..self.health.len())
            .filter(|&i| self.health[i].is_selectable(now))
            .collect();
        if available.is_empty() {
            available.push(self.rescue_least_bad());
        }
        if available.len() == 1 {
            return available[0];
        }

        available.sort_by(|&a, &b| {
            self.health[a]
                .score()
                .total_cmp(&self.health[b].score())
                .then(a.cmp(&b))
        });
        let ramps: Vec<f64> = available
            .iter()
            .map(|&i| self.health[i].ramp_up_weight)
            .collect();
        let weights = normalized_weights(&self.config.selection.rank_weights, &ramps);
        let draw: f64 = self.rng.gen_range(0.0..1.0);
        available[pick_weighted(&weights, draw)]
    }

    /// Every circuit is unusable: force the least-bad one back into service
    /// so a frame always has somewhere to go. Circuits mid-rebuild are only
    /// chosen when nothing else exists.
    fn rescue_least_bad(&mut self) -> CircuitIndex {
        let by_score = |a: &usize, b: &usize| {
            self.health[*a]
                .score()
                .total_cmp(&self.health[*b].score())
                .then(a.cmp(b))
        };
        let candidate = (0..self.health.len())
            .filter(|&i| !self.health[i].rebuilding)
            .min_by(by_score)
            .or_else(|| (0..self.health.len()).min_by(by_score))
            .unwrap_or(0);

        let min_weight = self.config.selection.min_circuit_weight;
        let health = &mut self.health[candidate];
        health.cooldown_until = None;
        health.ramp_up_weight = min_weight;
        warn!(
            circuit = candidate,
            score = health.score(),
            "All circuits unusable, rescued least-bad circuit"
        );
        self.emit(CircuitEvent::Rescued { circuit: candidate });
        candidate
    }

    // ── Send outcomes ──────────────────────────────────────────────────

    pub fn report_send_success(&mut self, circuit: CircuitIndex) {
        if !self.in_range(circuit, "report_send_success") {
            return;
        }
        let health = &mut self.health[circuit];
        health.send_failures = 0;
        health.total_frames_sent += 1;
    }

    pub fn report_send_failure(&mut self, circuit: CircuitIndex) {
        if !self.in_range(circuit, "report_send_failure") {
            return;
        }
        let threshold = self.config.cooldown.send_failure_threshold;
        let health = &mut self.health[circuit];
        let tripped = self.cooldown.record_send_failure(health);
        if tripped {
            warn!(circuit, threshold, "Send failure threshold reached");
            self.trigger_cooldown(circuit, CooldownReason::SendFailure);
        } else {
            debug!(
                circuit,
                failures = health.send_failures,
                threshold,
                "Circuit send failure"
            );
        }
    }

    fn trigger_cooldown(&mut self, circuit: CircuitIndex, reason: CooldownReason) {
        let now = self.phase.now();
        self.cooldown
            .trigger(&mut self.health[circuit], reason, now);
        warn!(
            circuit,
            reason = %reason,
            duration_ms = self.config.cooldown.duration_ms,
            "Circuit cooldown triggered, will ramp from minimum weight"
        );
        self.emit(CircuitEvent::CooldownTriggered { circuit, reason });
    }

    /// Store the playout layer's late-to-buffer rate for a circuit; used by
    /// rebuild evaluation on the next feedback cycle.
    pub fn report_late_to_buffer(&mut self, circuit: CircuitIndex, percent: f64) {
        if !self.in_range(circuit, "report_late_to_buffer") {
            return;
        }
        self.health[circuit].late_to_buffer_percent = percent;
    }

    // ── Feedback ───────────────────────────────────────────────────────

    /// Ingest one periodic feedback message from the peer.
    ///
    /// Metrics are always stored. Cooldown, ramp-up and rebuild policies only
    /// run once the call has settled and the circuit has enough samples.
    pub fn update_from_receiver_feedback<I>(&mut self, feedback: I)
    where
        I: IntoIterator<Item = (CircuitIndex, CircuitFeedback)>,
    {
        let phase = self.phase.current();

        for (circuit, stats) in feedback {
            if !self.in_range(circuit, "update_from_receiver_feedback") {
                continue;
            }
            self.health[circuit].apply_feedback(&stats);

            if !phase.is_settled() {
                continue;
            }
            if stats.frames_received < self.config.cooldown.min_frames_for_evaluation {
                continue;
            }
            self.evaluate_feedback_window(circuit, phase);
        }

        self.log_health_status();
    }

    /// Feedback from peers that only report late-frame percentages.
    pub fn update_from_late_percentages<I>(&mut self, late_percentages: I)
    where
        I: IntoIterator<Item = (CircuitIndex, f64)>,
    {
        self.update_from_receiver_feedback(
            late_percentages
                .into_iter()
                .map(|(circuit, late)| (circuit, CircuitFeedback::late_only(late))),
        );
    }

    fn evaluate_feedback_window(&mut self, circuit: CircuitIndex, phase: CallPhase) {
        let now = self.phase.now();

        let reason = self.cooldown.evaluate(&mut self.health[circuit], phase);
        if let Some(reason) = reason {
            let h = &self.health[circuit];
            debug!(
                circuit,
                phase = %phase,
                missing = h.missing_frame_percent,
                plc = h.plc_percent,
                reason = %reason,
                "Cooldown condition met"
            );
            if !h.in_cooldown(now) {
                self.trigger_cooldown(circuit, reason);
            }
        }

        let health = &mut self.health[circuit];
        if !health.in_cooldown(now) && health.ramp_up_weight > 0.0 && health.ramp_up_weight < 1.0
        {
            if self.cooldown.update_ramp_up(health) {
                debug!(
                    circuit,
                    weight = health.ramp_up_weight,
                    "Circuit ramping up"
                );
            } else if health.clean_windows_count == 0 {
                debug!(circuit, "Circuit ramp-up reset due to quality issues");
            }
        }

        if self.config.rebuild.evaluate_on_feedback {
            let late_to_buffer = self.health[circuit].late_to_buffer_percent;
            self.evaluate_circuit_rebuild(circuit, late_to_buffer);
        }

        if self.health[circuit].is_rebuild_candidate {
            self.check_quarantine_recovery(circuit);
        }
    }

    // ── Rebuild ────────────────────────────────────────────────────────

    /// Count one rebuild-evaluation window and quarantine the circuit after
    /// enough consecutive bad ones, provided no rebuild is in flight.
    ///
    /// `late_to_buffer_percent` comes from the playout layer: a low value
    /// means concealment is caused by the network rather than local lateness.
    pub fn evaluate_circuit_rebuild(&mut self, circuit: CircuitIndex, late_to_buffer_percent: f64) {
        if !self.in_range(circuit, "evaluate_circuit_rebuild") {
            return;
        }
        if !self.phase.current().is_settled() {
            return;
        }
        let min_frames = self.config.cooldown.min_frames_for_evaluation;
        let health = &mut self.health[circuit];
        if health.epoch_frames_sent() < min_frames {
            return;
        }

        let bad = self.rebuild.is_bad_window(health, late_to_buffer_percent);
        let had_streak = health.bad_windows_count;
        let due = self.rebuild.record_window(health, bad);
        if bad {
            debug!(
                circuit,
                bad_windows = health.bad_windows_count,
                plc = health.plc_percent,
                missing = health.missing_frame_percent,
                "Circuit bad rebuild window"
            );
        } else if had_streak > 0 {
            debug!(circuit, from = had_streak, "Circuit good window, bad streak reset");
        }

        if due && !health.is_held() && self.rebuild_in_flight.is_none() {
            let now = self.phase.now();
            let hold = self.rebuild.quarantine(health, now);
            let backoff_ms = u64::try_from(hold.as_millis()).unwrap_or(u64::MAX);
            warn!(
                circuit,
                backoff_ms,
                plc = health.plc_percent,
                bad_windows = health.bad_windows_count,
                failures = health.rebuild_failures,
                "Circuit quarantined"
            );
            self.emit(CircuitEvent::Quarantined {
                circuit,
                backoff_ms,
            });
        }
    }

    /// Resolve an expired quarantine: release a recovered circuit, or start a
    /// rebuild for one that is still bad. No-op before expiry; deferred while
    /// another rebuild is in flight.
    pub fn check_quarantine_recovery(&mut self, circuit: CircuitIndex) {
        if !self.in_range(circuit, "check_quarantine_recovery") {
            return;
        }
        let now = self.phase.now();
        match self.rebuild.verdict(&self.health[circuit], now) {
            QuarantineVerdict::Pending => {}
            QuarantineVerdict::Release => {
                self.rebuild.release(&mut self.health[circuit]);
                info!(circuit, "Circuit recovered during quarantine, ramping from minimum weight");
                self.emit(CircuitEvent::QuarantineReleased { circuit });
            }
            QuarantineVerdict::Rebuild => self.trigger_circuit_rebuild(circuit),
        }
    }

    fn trigger_circuit_rebuild(&mut self, circuit: CircuitIndex) {
        if let Some(in_flight) = self.rebuild_in_flight {
            warn!(
                circuit,
                in_flight = in_flight.circuit,
                "Rebuild already in progress, deferring"
            );
            self.emit(CircuitEvent::RebuildDeferred { circuit });
            return;
        }

        let health = &mut self.health[circuit];
        let score = health.score();
        let plc = health.plc_percent;
        let epoch = self.rebuild.begin(health);
        let ticket = RebuildTicket {
            call_id: self.call_id,
            circuit,
            epoch,
        };
        self.rebuild_in_flight = Some(ticket);
        self.pending_rebuilds.push(ticket);
        warn!(circuit, epoch, plc, score, "Rebuilding circuit");
        self.emit(CircuitEvent::RebuildRequested { circuit, epoch });
    }

    /// Rebuild requests started since the last call, for the transport.
    pub fn take_rebuild_requests(&mut self) -> Vec<RebuildTicket> {
        std::mem::take(&mut self.pending_rebuilds)
    }

    /// The transport reconnected `circuit` for `epoch`. Completions for an
    /// older epoch, or with no rebuild pending, are rejected.
    pub fn on_circuit_rebuilt(&mut self, circuit: CircuitIndex, epoch: u32) -> Result<(), CmxError> {
        self.checked(circuit)?;
        let health = &mut self.health[circuit];
        if !health.rebuilding || health.rebuild_epoch != epoch {
            debug!(
                circuit,
                epoch,
                current = health.rebuild_epoch,
                "Discarding stale rebuild completion"
            );
            return Err(CmxError::StaleRebuild {
                circuit,
                epoch,
                current: health.rebuild_epoch,
            });
        }
        self.rebuild.complete(health);
        self.release_rebuild_slot(circuit);
        info!(circuit, epoch, "Circuit rebuild succeeded, starting at minimum weight");
        self.emit(CircuitEvent::RebuildSucceeded { circuit, epoch });
        Ok(())
    }

    /// The transport could not reconnect `circuit`. Doubles the backoff (up
    /// to the cap) and quarantines the circuit again for that long. Ignored
    /// when no rebuild is in flight for the circuit.
    pub fn on_circuit_rebuild_failed(&mut self, circuit: CircuitIndex) {
        if !self.in_range(circuit, "on_circuit_rebuild_failed") {
            return;
        }
        let now = self.phase.now();
        let health = &mut self.health[circuit];
        if !health.rebuilding {
            debug!(
                circuit,
                current = health.rebuild_epoch,
                "Discarding rebuild failure with no rebuild in flight"
            );
            return;
        }
        self.rebuild.fail(health, now);
        let failures = health.rebuild_failures;
        let backoff_ms = health.rebuild_backoff_ms;
        self.release_rebuild_slot(circuit);
        error!(circuit, failures, backoff_ms, "Circuit rebuild failed");
        self.emit(CircuitEvent::RebuildFailed {
            circuit,
            failures,
            backoff_ms,
        });
    }

    /// Epoch-checked completion for a ticket issued by this scheduler.
    pub fn complete_rebuild(
        &mut self,
        ticket: RebuildTicket,
        outcome: RebuildOutcome,
    ) -> Result<(), CmxError> {
        if ticket.call_id != self.call_id {
            return Err(CmxError::ForeignCall {
                ticket_call: ticket.call_id.to_string(),
                call_id: self.call_id.to_string(),
            });
        }
        match outcome {
            RebuildOutcome::Rebuilt => self.on_circuit_rebuilt(ticket.circuit, ticket.epoch),
            RebuildOutcome::Failed => {
                self.checked(ticket.circuit)?;
                let health = &self.health[ticket.circuit];
                if !health.rebuilding || health.rebuild_epoch != ticket.epoch {
                    return Err(CmxError::StaleRebuild {
                        circuit: ticket.circuit,
                        epoch: ticket.epoch,
                        current: health.rebuild_epoch,
                    });
                }
                self.on_circuit_rebuild_failed(ticket.circuit);
                Ok(())
            }
        }
    }

    fn release_rebuild_slot(&mut self, circuit: CircuitIndex) {
        if self
            .rebuild_in_flight
            .is_some_and(|ticket| ticket.circuit == circuit)
        {
            self.rebuild_in_flight = None;
        }
    }

    // ── Observability ──────────────────────────────────────────────────

    pub fn get_circuit_stats(&self) -> Vec<CircuitStats> {
        let now = self.phase.now();
        self.health
            .iter()
            .enumerate()
            .map(|(i, h)| h.stats(i, now))
            .collect()
    }

    pub fn health_snapshot(&self) -> Vec<CircuitHealthSnapshot> {
        let now = self.phase.now();
        let min_frames = self.config.cooldown.min_frames_for_evaluation;
        self.health
            .iter()
            .enumerate()
            .map(|(i, h)| h.snapshot(i, now, min_frames))
            .collect()
    }

    fn log_health_status(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let now = self.phase.now();
        let min_frames = self.config.cooldown.min_frames_for_evaluation;
        let mut status = String::new();
        for (i, h) in self.health.iter().enumerate() {
            let _ = write!(
                status,
                "[{i}: score={:.1} late={:.1}% missing={:.1}% plc={:.1}% ",
                h.score(),
                h.late_frame_percent,
                h.missing_frame_percent,
                h.plc_percent
            );
            if h.in_cooldown(now) {
                let reason = h.last_cooldown_reason.map_or("?", |r| r.as_str());
                let _ = write!(status, "COOLDOWN({reason}) ");
            } else if h.rebuilding {
                let _ = write!(status, "REBUILDING(epoch={}) ", h.rebuild_epoch);
            } else if h.is_rebuild_candidate {
                status.push_str("QUARANTINED ");
            } else if h.ramp_up_weight < 1.0 {
                let _ = write!(status, "RAMP={:.0}% ", h.ramp_up_weight * 100.0);
            }
            let _ = write!(
                status,
                "sent={} peerRecv={}",
                h.epoch_frames_sent(),
                h.peer_frames_received
            );
            if let Some(rate) = h.delivery_rate(min_frames) {
                let _ = write!(status, " ({:.0}%)", rate * 100.0);
            }
            status.push_str("] ");
        }
        debug!(
            phase = %self.phase.current(),
            elapsed_s = self.phase.elapsed().as_secs_f64(),
            "Circuit health: {status}"
        );
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
