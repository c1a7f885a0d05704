//! Adaptive multipath circuit scheduler: per-frame circuit selection
//! (micro-burst + health-weighted), receiver feedback ingestion, cooldown
//! with slow ramp-up, and quarantine -> rebuild for persistently bad circuits.

pub mod cooldown;
pub mod health;
pub mod phase;
pub mod rebuild;
pub mod scheduler;
pub mod selection;
pub mod shared;
pub mod telemetry;

pub use cooldown::CooldownPolicy;
pub use health::{CircuitHealth, CircuitHealthSnapshot};
pub use phase::PhaseClock;
pub use rebuild::{QuarantineVerdict, RebuildPolicy};
pub use scheduler::{CircuitScheduler, SchedulerBuilder};
pub use shared::{RebuildCompleter, RebuildRequest, RebuildRequester, SharedScheduler};
pub use telemetry::{
    CircuitEvent, NoopTelemetry, RecordedEvent, RecordingTelemetry, TelemetrySink,
    TracingTelemetry,
};
