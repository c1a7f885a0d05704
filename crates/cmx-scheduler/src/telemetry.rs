//! Circuit lifecycle events for observability.
//!
//! The scheduler reports every cooldown, rescue, quarantine and rebuild step
//! to a [`TelemetrySink`]. Sinks are called with the scheduler lock held, so
//! `record` must return quickly and never block on I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::{error, info, warn};

use cmx_core::{CircuitIndex, CooldownReason};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CircuitEvent {
    CooldownTriggered {
        circuit: CircuitIndex,
        reason: CooldownReason,
    },
    /// Every circuit was unusable; this one was forced back into service.
    Rescued { circuit: CircuitIndex },
    Quarantined {
        circuit: CircuitIndex,
        backoff_ms: u64,
    },
    /// Quarantine expired and the circuit had recovered.
    QuarantineReleased { circuit: CircuitIndex },
    RebuildRequested { circuit: CircuitIndex, epoch: u32 },
    /// Another rebuild is in flight; retried on a later feedback cycle.
    RebuildDeferred { circuit: CircuitIndex },
    RebuildSucceeded { circuit: CircuitIndex, epoch: u32 },
    RebuildFailed {
        circuit: CircuitIndex,
        failures: u32,
        backoff_ms: u64,
    },
}

impl CircuitEvent {
    pub fn circuit(&self) -> CircuitIndex {
        match self {
            Self::CooldownTriggered { circuit, .. }
            | Self::Rescued { circuit }
            | Self::Quarantined { circuit, .. }
            | Self::QuarantineReleased { circuit }
            | Self::RebuildRequested { circuit, .. }
            | Self::RebuildDeferred { circuit }
            | Self::RebuildSucceeded { circuit, .. }
            | Self::RebuildFailed { circuit, .. } => *circuit,
        }
    }

    /// Snake-case event name, matching the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CooldownTriggered { .. } => "cooldown_triggered",
            Self::Rescued { .. } => "rescued",
            Self::Quarantined { .. } => "quarantined",
            Self::QuarantineReleased { .. } => "quarantine_released",
            Self::RebuildRequested { .. } => "rebuild_requested",
            Self::RebuildDeferred { .. } => "rebuild_deferred",
            Self::RebuildSucceeded { .. } => "rebuild_succeeded",
            Self::RebuildFailed { .. } => "rebuild_failed",
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &CircuitEvent);
}

/// Default sink: one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &CircuitEvent) {
        match event {
            CircuitEvent::CooldownTriggered { circuit, reason } => {
                warn!(circuit, reason = %reason, "telemetry: circuit cooldown");
            }
            CircuitEvent::Rescued { circuit } => {
                warn!(circuit, "telemetry: circuit rescued from all-unusable state");
            }
            CircuitEvent::Quarantined {
                circuit,
                backoff_ms,
            } => {
                warn!(circuit, backoff_ms, "telemetry: circuit quarantined");
            }
            CircuitEvent::QuarantineReleased { circuit } => {
                info!(circuit, "telemetry: circuit released from quarantine");
            }
            CircuitEvent::RebuildRequested { circuit, epoch } => {
                warn!(circuit, epoch, "telemetry: circuit rebuild requested");
            }
            CircuitEvent::RebuildDeferred { circuit } => {
                info!(circuit, "telemetry: circuit rebuild deferred");
            }
            CircuitEvent::RebuildSucceeded { circuit, epoch } => {
                info!(circuit, epoch, "telemetry: circuit rebuilt");
            }
            CircuitEvent::RebuildFailed {
                circuit,
                failures,
                backoff_ms,
            } => {
                error!(
                    circuit,
                    failures, backoff_ms, "telemetry: circuit rebuild failed"
                );
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: &CircuitEvent) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CircuitEvent,
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Events without timestamps, for assertions.
    pub fn kinds(&self) -> Vec<CircuitEvent> {
        self.events().into_iter().map(|r| r.event).collect()
    }

    pub fn count_where(&self, pred: impl Fn(&CircuitEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|r| pred(&r.event))
            .count()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: &CircuitEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedEvent {
                at: Utc::now(),
                event: event.clone(),
            });
    }
}
