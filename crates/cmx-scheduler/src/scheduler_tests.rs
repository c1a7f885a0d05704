use super::*;
use crate::telemetry::RecordingTelemetry;
use cmx_core::ManualClock;

struct Harness {
    clock: Arc<ManualClock>,
    telemetry: Arc<RecordingTelemetry>,
    scheduler: CircuitScheduler,
}

fn harness(num_circuits: usize) -> Harness {
    let mut config = SchedulerConfig::with_circuits(num_circuits);
    config.selection.seed = Some(7);
    let clock = Arc::new(ManualClock::new());
    let telemetry = Arc::new(RecordingTelemetry::new());
    let scheduler = CircuitScheduler::builder(config)
        .clock(clock.clone())
        .telemetry(telemetry.clone())
        .build()
        .unwrap();
    Harness {
        clock,
        telemetry,
        scheduler,
    }
}

fn window(missing: f64, plc: f64, frames: u64) -> CircuitFeedback {
    CircuitFeedback {
        late_percent: 0.0,
        missing_percent: missing,
        plc_percent: plc,
        frames_received: frames,
    }
}

fn send_frames(scheduler: &mut CircuitScheduler, circuit: CircuitIndex, count: u64) {
    for _ in 0..count {
        scheduler.report_send_success(circuit);
    }
}

/// Past the relaxed phase, every policy is active.
const STRICT_MS: u64 = 46_000;

#[test]
fn test_builder_rejects_zero_circuits() {
    let err = CircuitScheduler::builder(SchedulerConfig::with_circuits(0))
        .build()
        .unwrap_err();
    assert!(matches!(err, CmxError::InvalidCircuitCount(0)));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let mut config = SchedulerConfig::default();
    config.selection.burst_size = 0;
    let err = CircuitScheduler::builder(config).build().unwrap_err();
    assert!(matches!(err, CmxError::InvalidConfig(_)));
}

#[test]
fn test_default_has_three_circuits() {
    let scheduler = CircuitScheduler::default();
    assert_eq!(scheduler.num_circuits(), 3);
    assert_eq!(scheduler.get_circuit_stats().len(), 3);
    assert_eq!(scheduler.current_phase(), CallPhase::Establishment);
}

#[test]
fn test_establishment_round_robin_ignores_bursts() {
    let mut h = harness(3);
    let picks: Vec<_> = (0..6).map(|_| h.scheduler.select_circuit()).collect();
    assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn test_burst_outside_establishment() {
    let mut h = harness(3);
    h.clock.advance_ms(5_000);
    let first = h.scheduler.select_circuit();
    for _ in 1..4 {
        assert_eq!(h.scheduler.select_circuit(), first);
    }
}

#[test]
fn test_single_circuit_always_selected() {
    let mut h = harness(1);
    h.clock.advance_ms(STRICT_MS);
    for _ in 0..20 {
        assert_eq!(h.scheduler.select_circuit(), 0);
    }
}

#[test]
fn test_healthiest_circuit_dominates() {
    let mut h = harness(3);
    h.clock.advance_ms(5_000);
    // Warmup: scores steer selection, no cooldowns yet.
    h.scheduler
        .update_from_receiver_feedback([(1, window(4.0, 4.0, 10)), (2, window(8.0, 8.0, 10))]);

    let mut counts = [0usize; 3];
    for _ in 0..4_000 {
        counts[h.scheduler.select_circuit()] += 1;
    }
    assert!(counts[0] > counts[1], "{counts:?}");
    assert!(counts[1] > counts[2], "{counts:?}");
    assert!(counts[2] > 0, "{counts:?}");
}

#[test]
fn test_send_failures_trigger_cooldown() {
    let mut h = harness(3);
    h.scheduler.report_send_failure(0);
    h.scheduler.report_send_failure(0);
    assert_eq!(h.scheduler.health(0).unwrap().send_failures, 2);
    assert!(!h.scheduler.get_circuit_stats()[0].in_cooldown);

    h.scheduler.report_send_failure(0);
    let health = h.scheduler.health(0).unwrap();
    assert_eq!(health.last_cooldown_reason, Some(CooldownReason::SendFailure));
    assert_eq!(health.send_failures, 0);
    assert_eq!(health.ramp_up_weight, 0.05);
    assert!(h.scheduler.get_circuit_stats()[0].in_cooldown);
    assert_eq!(
        h.telemetry.kinds(),
        vec![CircuitEvent::CooldownTriggered {
            circuit: 0,
            reason: CooldownReason::SendFailure,
        }]
    );
}

#[test]
fn test_send_success_resets_failures() {
    let mut h = harness(3);
    h.scheduler.report_send_failure(1);
    h.scheduler.report_send_failure(1);
    h.scheduler.report_send_success(1);
    assert_eq!(h.scheduler.health(1).unwrap().send_failures, 0);
    assert_eq!(h.scheduler.health(1).unwrap().total_frames_sent, 1);

    h.scheduler.report_send_failure(1);
    h.scheduler.report_send_failure(1);
    assert!(!h.scheduler.get_circuit_stats()[1].in_cooldown);
}

#[test]
fn test_out_of_range_reports_are_ignored() {
    let mut h = harness(3);
    h.scheduler.report_send_success(3);
    h.scheduler.report_send_failure(99);
    h.scheduler.report_late_to_buffer(5, 2.0);
    h.scheduler
        .update_from_receiver_feedback([(7, window(50.0, 50.0, 100))]);
    h.scheduler.evaluate_circuit_rebuild(4, 0.0);
    h.scheduler.on_circuit_rebuild_failed(3);
    assert!(h.telemetry.kinds().is_empty());
    assert!(
        h.scheduler
            .get_circuit_stats()
            .iter()
            .all(|s| s.total_frames_sent == 0)
    );
}

#[test]
fn test_rescue_when_every_circuit_cools_down() {
    let mut h = harness(3);
    h.clock.advance_ms(5_000);
    h.scheduler
        .update_from_receiver_feedback([(2, window(1.0, 0.0, 10))]);
    for circuit in 0..3 {
        for _ in 0..3 {
            h.scheduler.report_send_failure(circuit);
        }
    }

    let picked = h.scheduler.select_circuit();
    assert!(picked < 3);
    // Equal send-failure history; circuit 2 carries a missing-frame penalty.
    assert_ne!(picked, 2);
    let health = h.scheduler.health(picked).unwrap();
    assert_eq!(health.cooldown_until, None);
    assert_eq!(health.ramp_up_weight, 0.05);
    assert_eq!(
        h.telemetry
            .count_where(|e| matches!(e, CircuitEvent::Rescued { .. })),
        1
    );
}

#[test]
fn test_feedback_metrics_stored_in_every_phase() {
    let mut h = harness(2);
    h.scheduler.update_from_receiver_feedback([(
        1,
        CircuitFeedback {
            late_percent: 3.0,
            missing_percent: 20.0,
            plc_percent: 9.0,
            frames_received: 55,
        },
    )]);
    let health = h.scheduler.health(1).unwrap();
    assert_eq!(health.late_frame_percent, 3.0);
    assert_eq!(health.missing_frame_percent, 20.0);
    assert_eq!(health.plc_percent, 9.0);
    assert_eq!(health.peer_frames_received, 55);
    assert!(health.cooldown_until.is_none());
}

#[test]
fn test_high_missing_in_strict_triggers_cooldown() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    h.scheduler
        .update_from_receiver_feedback([(1, window(20.0, 0.0, 40))]);
    let health = h.scheduler.health(1).unwrap();
    assert_eq!(health.last_cooldown_reason, Some(CooldownReason::HighMissing));
    assert!(h.scheduler.get_circuit_stats()[1].in_cooldown);
}

#[test]
fn test_high_missing_in_warmup_is_ignored() {
    let mut h = harness(3);
    h.clock.advance_ms(5_000);
    assert_eq!(h.scheduler.current_phase(), CallPhase::Warmup);
    h.scheduler
        .update_from_receiver_feedback([(1, window(20.0, 0.0, 40))]);
    assert_eq!(h.scheduler.health(1).unwrap().last_cooldown_reason, None);
    assert!(h.telemetry.kinds().is_empty());
}

#[test]
fn test_small_sample_skips_evaluation() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    h.scheduler
        .update_from_receiver_feedback([(1, window(20.0, 20.0, 29))]);
    assert_eq!(h.scheduler.health(1).unwrap().last_cooldown_reason, None);
}

#[test]
fn test_relaxed_thresholds_are_looser() {
    let mut h = harness(3);
    h.clock.advance_ms(20_000);
    assert_eq!(h.scheduler.current_phase(), CallPhase::Relaxed);
    h.scheduler
        .update_from_receiver_feedback([(0, window(10.0, 7.0, 40))]);
    assert_eq!(h.scheduler.health(0).unwrap().last_cooldown_reason, None);

    h.scheduler
        .update_from_receiver_feedback([(0, window(16.0, 0.0, 40))]);
    assert_eq!(
        h.scheduler.health(0).unwrap().last_cooldown_reason,
        Some(CooldownReason::HighMissing)
    );
}

#[test]
fn test_existing_cooldown_is_not_extended() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    h.scheduler
        .update_from_receiver_feedback([(1, window(20.0, 0.0, 40))]);
    let until = h.scheduler.health(1).unwrap().cooldown_until;

    h.clock.advance_ms(5_000);
    h.scheduler
        .update_from_receiver_feedback([(1, window(20.0, 0.0, 40))]);
    assert_eq!(h.scheduler.health(1).unwrap().cooldown_until, until);
    assert_eq!(
        h.telemetry
            .count_where(|e| matches!(e, CircuitEvent::CooldownTriggered { .. })),
        1
    );
}

#[test]
fn test_delivery_rate_cooldown_after_two_windows() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    send_frames(&mut h.scheduler, 2, 100);

    h.scheduler
        .update_from_receiver_feedback([(2, window(0.0, 1.0, 80))]);
    assert_eq!(h.scheduler.health(2).unwrap().last_cooldown_reason, None);
    assert_eq!(h.scheduler.health(2).unwrap().bad_delivery_windows, 1);

    h.scheduler
        .update_from_receiver_feedback([(2, window(0.0, 1.0, 80))]);
    assert_eq!(
        h.scheduler.health(2).unwrap().last_cooldown_reason,
        Some(CooldownReason::DeliveryRate)
    );
}

#[test]
fn test_ramp_up_after_cooldown() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    for _ in 0..3 {
        h.scheduler.report_send_failure(0);
    }
    h.clock.advance_ms(8_000);

    let clean = [(0, window(0.0, 0.0, 40))];
    h.scheduler.update_from_receiver_feedback(clean);
    assert_eq!(h.scheduler.health(0).unwrap().ramp_up_weight, 0.05);
    h.scheduler.update_from_receiver_feedback(clean);
    assert!((h.scheduler.health(0).unwrap().ramp_up_weight - 0.075).abs() < 1e-12);

    let mut previous = 0.075;
    for _ in 0..40 {
        h.scheduler.update_from_receiver_feedback(clean);
        let weight = h.scheduler.health(0).unwrap().ramp_up_weight;
        assert!(weight >= previous && weight <= 1.0);
        previous = weight;
    }
    assert_eq!(previous, 1.0);
}

#[test]
fn test_no_ramp_up_during_cooldown() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    for _ in 0..3 {
        h.scheduler.report_send_failure(0);
    }
    for _ in 0..4 {
        h.scheduler
            .update_from_receiver_feedback([(0, window(0.0, 0.0, 40))]);
    }
    assert_eq!(h.scheduler.health(0).unwrap().ramp_up_weight, 0.05);
}

#[test]
fn test_legacy_late_percentages_update_metrics_only() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    h.scheduler.update_from_late_percentages([(0, 40.0), (2, 12.5)]);
    let stats = h.scheduler.get_circuit_stats();
    assert_eq!(stats[0].late_frame_percent, 40.0);
    assert_eq!(stats[2].late_frame_percent, 12.5);
    assert!(stats.iter().all(|s| !s.in_cooldown));
}

fn quarantine_circuit(h: &mut Harness, circuit: CircuitIndex) {
    send_frames(&mut h.scheduler, circuit, 40);
    for _ in 0..3 {
        h.scheduler
            .update_from_receiver_feedback([(circuit, window(0.0, 15.0, 40))]);
    }
}

#[test]
fn test_three_bad_windows_quarantine() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    quarantine_circuit(&mut h, 1);

    let health = h.scheduler.health(1).unwrap();
    assert!(health.is_rebuild_candidate);
    assert_eq!(health.ramp_up_weight, 0.0);
    assert!(!h.scheduler.health(0).unwrap().is_rebuild_candidate);
    assert!(!h.scheduler.health(2).unwrap().is_rebuild_candidate);
    assert!(h.telemetry.kinds().contains(&CircuitEvent::Quarantined {
        circuit: 1,
        backoff_ms: 10_000,
    }));
}

#[test]
fn test_quarantined_circuit_not_selected() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    quarantine_circuit(&mut h, 1);
    // Let the HighPlc cooldown lapse; quarantine alone must keep it out.
    h.clock.advance_ms(8_000);
    for _ in 0..400 {
        assert_ne!(h.scheduler.select_circuit(), 1);
    }
}

#[test]
fn test_rebuild_gate_needs_traffic() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    send_frames(&mut h.scheduler, 1, 29);
    for _ in 0..5 {
        h.scheduler.evaluate_circuit_rebuild(1, 0.0);
    }
    assert_eq!(h.scheduler.health(1).unwrap().bad_windows_count, 0);
}

#[test]
fn test_rebuild_not_evaluated_in_warmup() {
    let mut h = harness(3);
    h.clock.advance_ms(5_000);
    send_frames(&mut h.scheduler, 1, 40);
    h.scheduler
        .update_from_receiver_feedback([(1, window(0.0, 15.0, 40))]);
    h.scheduler.evaluate_circuit_rebuild(1, 0.0);
    assert_eq!(h.scheduler.health(1).unwrap().bad_windows_count, 0);
}

#[test]
fn test_late_to_buffer_exempts_local_lateness() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    send_frames(&mut h.scheduler, 1, 40);
    h.scheduler.report_late_to_buffer(1, 5.0);
    // plc 10 is bad only when playout lateness does not explain it.
    for _ in 0..4 {
        h.scheduler
            .update_from_receiver_feedback([(1, window(0.0, 10.0, 40))]);
    }
    assert_eq!(h.scheduler.health(1).unwrap().bad_windows_count, 0);

    h.scheduler.report_late_to_buffer(1, 0.5);
    h.scheduler
        .update_from_receiver_feedback([(1, window(0.0, 10.0, 40))]);
    assert_eq!(h.scheduler.health(1).unwrap().bad_windows_count, 1);
}

#[test]
fn test_quarantine_release_on_recovery() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    quarantine_circuit(&mut h, 1);

    h.clock.advance_ms(10_000);
    h.scheduler
        .update_from_receiver_feedback([(1, window(0.0, 0.0, 40))]);

    let health = h.scheduler.health(1).unwrap();
    assert!(!health.is_rebuild_candidate);
    assert!(!health.rebuilding);
    assert_eq!(health.ramp_up_weight, 0.05);
    assert!(
        h.telemetry
            .kinds()
            .contains(&CircuitEvent::QuarantineReleased { circuit: 1 })
    );
    assert!(h.scheduler.take_rebuild_requests().is_empty());
}

#[test]
fn test_quarantine_check_before_expiry_is_noop() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    quarantine_circuit(&mut h, 1);
    h.clock.advance_ms(9_999);
    h.scheduler.check_quarantine_recovery(1);
    h.scheduler.check_quarantine_recovery(1);
    assert!(h.scheduler.health(1).unwrap().is_rebuild_candidate);
    assert_eq!(h.scheduler.rebuild_in_flight(), None);
}

#[test]
fn test_still_bad_after_quarantine_requests_rebuild() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    quarantine_circuit(&mut h, 1);

    h.clock.advance_ms(10_000);
    h.scheduler
        .update_from_receiver_feedback([(1, window(0.0, 15.0, 40))]);

    let ticket = RebuildTicket {
        call_id: h.scheduler.call_id(),
        circuit: 1,
        epoch: 1,
    };
    assert_eq!(h.scheduler.rebuild_in_flight(), Some(ticket));
    assert_eq!(h.scheduler.take_rebuild_requests(), vec![ticket]);
    assert!(h.scheduler.take_rebuild_requests().is_empty());

    let health = h.scheduler.health(1).unwrap();
    assert!(health.rebuilding);
    assert_eq!(health.ramp_up_weight, 0.0);
    assert_eq!(health.bad_windows_count, 0);
}

fn start_rebuild(h: &mut Harness, circuit: CircuitIndex) -> RebuildTicket {
    quarantine_circuit(h, circuit);
    h.clock.advance_ms(10_000);
    h.scheduler
        .update_from_receiver_feedback([(circuit, window(0.0, 15.0, 40))]);
    let mut tickets = h.scheduler.take_rebuild_requests();
    assert_eq!(tickets.len(), 1);
    tickets.remove(0)
}

#[test]
fn test_rebuilt_circuit_starts_fresh_epoch() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    let ticket = start_rebuild(&mut h, 1);

    h.scheduler
        .on_circuit_rebuilt(ticket.circuit, ticket.epoch)
        .unwrap();
    let health = h.scheduler.health(1).unwrap();
    assert!(!health.rebuilding);
    assert_eq!(health.ramp_up_weight, 0.05);
    assert_eq!(health.rebuild_backoff_ms, 10_000);
    assert_eq!(health.epoch_frames_sent(), 0);
    assert_eq!(health.total_frames_sent, 40);
    assert_eq!(h.scheduler.rebuild_in_flight(), None);
    assert!(h.telemetry.kinds().contains(&CircuitEvent::RebuildSucceeded {
        circuit: 1,
        epoch: 1,
    }));
}

#[test]
fn test_stale_rebuild_completion_rejected() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    let ticket = start_rebuild(&mut h, 1);

    let err = h.scheduler.on_circuit_rebuilt(1, ticket.epoch + 1).unwrap_err();
    assert!(matches!(
        err,
        CmxError::StaleRebuild {
            circuit: 1,
            epoch: 2,
            current: 1
        }
    ));
    assert!(h.scheduler.health(1).unwrap().rebuilding);

    h.scheduler.on_circuit_rebuilt(1, ticket.epoch).unwrap();
    // A duplicate completion finds nothing pending.
    assert!(h.scheduler.on_circuit_rebuilt(1, ticket.epoch).is_err());
}

#[test]
fn test_rebuilt_out_of_range() {
    let mut h = harness(2);
    let err = h.scheduler.on_circuit_rebuilt(2, 1).unwrap_err();
    assert!(matches!(
        err,
        CmxError::CircuitOutOfRange { index: 2, count: 2 }
    ));
}

#[test]
fn test_rebuild_failure_backs_off_and_requarantines() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    let ticket = start_rebuild(&mut h, 1);

    h.scheduler
        .complete_rebuild(ticket, RebuildOutcome::Failed)
        .unwrap();
    let health = h.scheduler.health(1).unwrap();
    assert!(!health.rebuilding);
    assert!(health.is_rebuild_candidate);
    assert_eq!(health.rebuild_failures, 1);
    assert_eq!(health.rebuild_backoff_ms, 20_000);
    assert_eq!(health.bad_windows_count, 0);
    assert_eq!(h.scheduler.rebuild_in_flight(), None);
}

#[test]
fn test_repeated_failures_cap_backoff() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    let mut ticket = start_rebuild(&mut h, 0);
    let mut observed = Vec::new();
    for _ in 0..5 {
        h.scheduler
            .complete_rebuild(ticket, RebuildOutcome::Failed)
            .unwrap();
        let backoff_ms = h.scheduler.health(0).unwrap().rebuild_backoff_ms;
        observed.push(backoff_ms);

        // Still bad through the backoff: rebuilt again at expiry.
        for _ in 0..3 {
            h.scheduler
                .update_from_receiver_feedback([(0, window(0.0, 15.0, 40))]);
        }
        h.clock.advance_ms(backoff_ms);
        h.scheduler
            .update_from_receiver_feedback([(0, window(0.0, 15.0, 40))]);
        let mut tickets = h.scheduler.take_rebuild_requests();
        assert_eq!(tickets.len(), 1);
        ticket = tickets.remove(0);
    }
    assert_eq!(observed, vec![20_000, 40_000, 60_000, 60_000, 60_000]);
    assert_eq!(ticket.epoch, 6);
}

#[test]
fn test_rebuild_failure_without_rebuild_in_flight_is_ignored() {
    let mut h = harness(3);
    h.clock.advance_ms(50_000);
    h.scheduler.on_circuit_rebuild_failed(0);

    let health = h.scheduler.health(0).unwrap();
    assert_eq!(health.ramp_up_weight, 1.0);
    assert_eq!(health.rebuild_backoff_ms, 10_000);
    assert_eq!(health.rebuild_failures, 0);
    assert!(!health.is_rebuild_candidate);
    assert!(h.telemetry.kinds().is_empty());

    let mut picks = [0u32; 3];
    for _ in 0..4_000 {
        picks[h.scheduler.select_circuit()] += 1;
    }
    assert!(picks[0] > 0, "{picks:?}");
}

#[test]
fn test_duplicate_rebuild_failure_is_ignored() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    let ticket = start_rebuild(&mut h, 1);
    h.scheduler.on_circuit_rebuild_failed(ticket.circuit);
    h.scheduler.on_circuit_rebuild_failed(ticket.circuit);

    let health = h.scheduler.health(1).unwrap();
    assert_eq!(health.rebuild_failures, 1);
    assert_eq!(health.rebuild_backoff_ms, 20_000);
    assert_eq!(
        h.telemetry
            .count_where(|e| matches!(e, CircuitEvent::RebuildFailed { .. })),
        1
    );
}

#[test]
fn test_complete_rebuild_rejects_foreign_call() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    let mut ticket = start_rebuild(&mut h, 1);
    ticket.call_id = CallId::new();

    let err = h
        .scheduler
        .complete_rebuild(ticket, RebuildOutcome::Rebuilt)
        .unwrap_err();
    assert!(matches!(err, CmxError::ForeignCall { .. }));
    assert!(h.scheduler.health(1).unwrap().rebuilding);
}

#[test]
fn test_complete_rebuild_failed_checks_epoch() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    let mut ticket = start_rebuild(&mut h, 1);
    ticket.epoch = 9;
    assert!(matches!(
        h.scheduler.complete_rebuild(ticket, RebuildOutcome::Failed),
        Err(CmxError::StaleRebuild { .. })
    ));
    assert_eq!(h.scheduler.health(1).unwrap().rebuild_failures, 0);
}

#[test]
fn test_second_rebuild_deferred_until_first_completes() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    send_frames(&mut h.scheduler, 0, 40);
    send_frames(&mut h.scheduler, 1, 40);
    let both_bad = [(0, window(0.0, 15.0, 40)), (1, window(0.0, 15.0, 40))];
    for _ in 0..3 {
        h.scheduler.update_from_receiver_feedback(both_bad);
    }
    assert!(h.scheduler.health(0).unwrap().is_rebuild_candidate);
    assert!(h.scheduler.health(1).unwrap().is_rebuild_candidate);

    h.clock.advance_ms(10_000);
    h.scheduler.update_from_receiver_feedback(both_bad);
    let first = h.scheduler.take_rebuild_requests();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].circuit, 0);
    assert!(!h.scheduler.health(1).unwrap().rebuilding);
    assert!(
        h.telemetry
            .kinds()
            .contains(&CircuitEvent::RebuildDeferred { circuit: 1 })
    );

    h.scheduler.update_from_receiver_feedback(both_bad);
    assert!(h.scheduler.take_rebuild_requests().is_empty());

    h.scheduler.on_circuit_rebuilt(0, first[0].epoch).unwrap();
    h.scheduler
        .update_from_receiver_feedback([(1, window(0.0, 15.0, 40))]);
    let second = h.scheduler.take_rebuild_requests();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].circuit, 1);
}

#[test]
fn test_no_quarantine_while_rebuild_in_flight() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    start_rebuild(&mut h, 0);

    quarantine_circuit(&mut h, 2);
    let health = h.scheduler.health(2).unwrap();
    assert!(!health.is_rebuild_candidate);
    assert!(health.bad_windows_count >= 3);
}

#[test]
fn test_health_snapshot_reports_rebuild_state() {
    let mut h = harness(3);
    h.clock.advance_ms(STRICT_MS);
    start_rebuild(&mut h, 2);

    let snapshot = h.scheduler.health_snapshot();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot[2].rebuilding);
    assert_eq!(snapshot[2].rebuild_epoch, 1);
    assert_eq!(snapshot[2].ramp_up_weight, 0.0);
    assert!(!snapshot[0].rebuilding);
}

#[test]
fn test_call_elapsed_tracks_clock() {
    let h = harness(3);
    h.clock.advance_ms(15_000);
    assert_eq!(h.scheduler.call_elapsed(), Duration::from_secs(15));
    assert_eq!(h.scheduler.current_phase(), CallPhase::Relaxed);
}
