use std::sync::Arc;
use std::time::{Duration, Instant};

use cmx_config::PhaseConfig;
use cmx_core::{CallPhase, Clock};

/// Derives the call phase from time elapsed since the call started.
///
/// Nothing is cached: every query reads the clock, so a phase can never be
/// stale or leak from a previous call.
#[derive(Debug, Clone)]
pub struct PhaseClock {
    clock: Arc<dyn Clock>,
    call_start: Instant,
    phases: PhaseConfig,
}

impl PhaseClock {
    /// Start the call timer now.
    pub fn start(clock: Arc<dyn Clock>, phases: PhaseConfig) -> Self {
        let call_start = clock.now();
        Self {
            clock,
            call_start,
            phases,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.call_start)
    }

    pub fn current(&self) -> CallPhase {
        self.phases.phase_at(self.elapsed())
    }
}
