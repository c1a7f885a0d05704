use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use cmx_config::{SchedulerConfig, validate_config};
use cmx_core::{CircuitIndex, CmxError, ManualClock, OutputFormat, RebuildOutcome};
use cmx_scheduler::{
    CircuitEvent, CircuitHealthSnapshot, CircuitScheduler, RebuildRequest, RecordedEvent,
    RecordingTelemetry, SharedScheduler, TelemetrySink, TracingTelemetry,
};

use crate::cli::SimulateArgs;
use crate::config_cmds::load_effective;
use crate::network::{CircuitTransport, SimulatedNetwork, Transmit};

/// One voice frame every 20 ms.
const FRAME_MS: u64 = 20;

/// Forwards every event to several sinks.
struct FanoutTelemetry(Vec<Arc<dyn TelemetrySink>>);

impl TelemetrySink for FanoutTelemetry {
    fn record(&self, event: &CircuitEvent) {
        for sink in &self.0 {
            sink.record(event);
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub(crate) struct WorkerStats {
    pub rebuilt: u32,
    pub failed: u32,
    /// Completions that arrived for an ended call or a superseded epoch.
    pub discarded: u32,
}

#[derive(Debug, Serialize)]
pub(crate) struct CircuitSummary {
    pub circuit: CircuitIndex,
    pub selected: u64,
    pub send_failures: u64,
    pub lost: u64,
    pub loss: f64,
    pub reconnects: u32,
    pub health: CircuitHealthSnapshot,
}

#[derive(Debug, Serialize)]
pub(crate) struct SimulationReport {
    pub call_id: String,
    pub duration_secs: u64,
    pub frames: u64,
    pub final_phase: String,
    pub circuits: Vec<CircuitSummary>,
    pub event_counts: BTreeMap<String, usize>,
    pub rebuilds: WorkerStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<RecordedEvent>,
}

fn probabilities(name: &str, values: &[f64]) -> Result<()> {
    for (i, p) in values.iter().enumerate() {
        if !(0.0..=1.0).contains(p) {
            bail!("--{name} entry {i} must be within [0, 1] (got {p})");
        }
    }
    Ok(())
}

fn build_config(args: &SimulateArgs) -> Result<SchedulerConfig> {
    let mut config = load_effective(args.config.as_deref())?;
    if let Some(circuits) = args.circuits {
        config.num_circuits = circuits;
    }
    if args.seed.is_some() {
        config.selection.seed = args.seed;
    }
    validate_config(&config).context("Invalid scheduler config for simulation")?;
    Ok(config)
}

/// Consume rebuild requests and complete each one after `latency_ms` of
/// virtual time. Exits once the call's scheduler (and with it the sender) is
/// dropped.
pub(crate) async fn run_rebuild_worker<T: CircuitTransport + ?Sized>(
    mut requests: mpsc::UnboundedReceiver<RebuildRequest>,
    transport: Arc<T>,
    mut virtual_ms: watch::Receiver<u64>,
    latency_ms: u64,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    while let Some(request) = requests.recv().await {
        let due = *virtual_ms.borrow_and_update() + latency_ms;
        loop {
            let now = *virtual_ms.borrow_and_update();
            if now >= due || virtual_ms.changed().await.is_err() {
                break;
            }
        }

        let ticket = request.ticket;
        let ok = transport.reconnect(ticket.circuit, ticket.epoch).await;
        let outcome = if ok {
            RebuildOutcome::Rebuilt
        } else {
            RebuildOutcome::Failed
        };
        match request.complete(outcome) {
            Ok(()) if ok => stats.rebuilt += 1,
            Ok(()) => stats.failed += 1,
            Err(e @ (CmxError::CallEnded { .. } | CmxError::StaleRebuild { .. })) => {
                debug!(circuit = ticket.circuit, "Discarded rebuild completion: {e}");
                stats.discarded += 1;
            }
            Err(e) => {
                tracing::warn!(circuit = ticket.circuit, "Rebuild completion rejected: {e}");
                stats.discarded += 1;
            }
        }
    }
    stats
}

pub(crate) async fn run_simulation(
    config: SchedulerConfig,
    args: &SimulateArgs,
) -> Result<SimulationReport> {
    let num_circuits = config.num_circuits;
    let clock = Arc::new(ManualClock::new());
    let recorder = Arc::new(RecordingTelemetry::new());
    let telemetry = FanoutTelemetry(vec![
        recorder.clone() as Arc<dyn TelemetrySink>,
        Arc::new(TracingTelemetry),
    ]);

    let scheduler = CircuitScheduler::builder(config)
        .clock(clock.clone())
        .telemetry(Arc::new(telemetry))
        .build()?;
    let call_id = scheduler.call_id();

    let network = Arc::new(SimulatedNetwork::new(
        &args.loss,
        &args.send_failure,
        num_circuits,
        args.rebuild_success,
        args.seed,
    ));
    let (request_tx, request_rx) = mpsc::unbounded_channel::<RebuildRequest>();
    let (time_tx, time_rx) = watch::channel(0u64);
    let shared = SharedScheduler::new(scheduler).with_requester(Arc::new(request_tx));
    let worker = tokio::spawn(run_rebuild_worker(
        request_rx,
        network.clone(),
        time_rx,
        args.rebuild_latency_ms,
    ));

    info!(%call_id, num_circuits, duration_secs = args.duration_secs, "Starting simulated call");

    let total_frames = args.duration_secs * 1_000 / FRAME_MS;
    let frames_per_feedback = (args.feedback_interval_ms / FRAME_MS).max(1);
    let mut selected = vec![0u64; num_circuits];
    let mut send_failures = vec![0u64; num_circuits];
    let mut lost = vec![0u64; num_circuits];

    for frame in 1..=total_frames {
        let circuit = shared.select_circuit();
        selected[circuit] += 1;
        match network.transmit(circuit) {
            Transmit::SendFailed => {
                send_failures[circuit] += 1;
                shared.report_send_failure(circuit);
            }
            Transmit::Lost => {
                lost[circuit] += 1;
                shared.report_send_success(circuit);
            }
            Transmit::Delivered => shared.report_send_success(circuit),
        }

        clock.advance_ms(FRAME_MS);
        let _ = time_tx.send(u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX));

        if frame % frames_per_feedback == 0 {
            let feedback = network.take_feedback();
            for (i, fb) in &feedback {
                // Playout blames local lateness for a small share of late frames.
                shared.report_late_to_buffer(*i, fb.late_percent * 0.1);
            }
            shared.update_from_receiver_feedback(feedback);
        }
        tokio::task::yield_now().await;
    }

    let final_phase = shared.current_phase().to_string();
    let snapshots = shared.health_snapshot();
    drop(shared);
    drop(time_tx);
    let rebuilds = worker.await.context("Rebuild worker panicked")?;

    let virtual_circuits = network.circuits();
    let circuits = snapshots
        .into_iter()
        .enumerate()
        .map(|(i, health)| CircuitSummary {
            circuit: i,
            selected: selected[i],
            send_failures: send_failures[i],
            lost: lost[i],
            loss: virtual_circuits[i].loss,
            reconnects: virtual_circuits[i].reconnects,
            health,
        })
        .collect();

    let events = recorder.events();
    let mut event_counts = BTreeMap::new();
    for recorded in &events {
        *event_counts
            .entry(recorded.event.kind().to_string())
            .or_insert(0) += 1;
    }

    Ok(SimulationReport {
        call_id: call_id.to_string(),
        duration_secs: args.duration_secs,
        frames: total_frames,
        final_phase,
        circuits,
        event_counts,
        rebuilds,
        events: if args.events { events } else { Vec::new() },
    })
}

fn print_text(report: &SimulationReport) {
    println!(
        "call {}  {}s  {} frames  phase={}",
        report.call_id, report.duration_secs, report.frames, report.final_phase
    );
    println!(
        "{:>3} {:>8} {:>7} {:>6} {:>6} {:>6} {:>7} {:>9}",
        "#", "selected", "sendErr", "lost", "loss", "score", "weight", "state"
    );
    for c in &report.circuits {
        let state = if c.health.rebuilding {
            "rebuild"
        } else if c.health.quarantined {
            "quarant"
        } else if c.health.in_cooldown {
            "cooldown"
        } else {
            "ok"
        };
        println!(
            "{:>3} {:>8} {:>7} {:>6} {:>5.1}% {:>6.1} {:>6.0}% {:>9}",
            c.circuit,
            c.selected,
            c.send_failures,
            c.lost,
            c.loss * 100.0,
            c.health.score,
            c.health.ramp_up_weight * 100.0,
            state
        );
    }
    if !report.event_counts.is_empty() {
        println!("events:");
        for (kind, count) in &report.event_counts {
            println!("  {kind}: {count}");
        }
    }
    println!(
        "rebuilds: {} ok, {} failed, {} discarded",
        report.rebuilds.rebuilt, report.rebuilds.failed, report.rebuilds.discarded
    );
    for recorded in &report.events {
        println!(
            "  {} {} circuit={}",
            recorded.at.format("%H:%M:%S%.3f"),
            recorded.event.kind(),
            recorded.event.circuit()
        );
    }
}

pub(crate) async fn handle_simulate(args: SimulateArgs, format: OutputFormat) -> Result<()> {
    probabilities("loss", &args.loss)?;
    probabilities("send-failure", &args.send_failure)?;
    if !(0.0..=1.0).contains(&args.rebuild_success) {
        bail!("--rebuild-success must be within [0, 1]");
    }
    if args.duration_secs == 0 {
        bail!("--duration-secs must be > 0");
    }

    let config = build_config(&args)?;
    let report = run_simulation(config, &args).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text(&report),
    }
    Ok(())
}

#[cfg(test)]
#[path = "simulate_tests.rs"]
mod tests;
