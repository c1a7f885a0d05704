//! Call-scoped, thread-safe handle around [`CircuitScheduler`].
//!
//! The frame-send path and the feedback path run on different threads at very
//! different rates. Both go through one mutex guarding the whole scheduler,
//! so multi-field updates (cooldown, quarantine, rebuild start) are never
//! observed half-done. Rebuild requests are handed to the transport only
//! after the lock is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use cmx_core::{
    CallId, CallPhase, CircuitFeedback, CircuitIndex, CircuitStats, CmxError, RebuildOutcome,
    RebuildTicket,
};

use crate::health::CircuitHealthSnapshot;
use crate::scheduler::CircuitScheduler;

/// Transport-side receiver of rebuild requests. Must not block: the actual
/// close + reopen happens asynchronously and is reported through
/// [`RebuildRequest::complete`].
pub trait RebuildRequester: Send + Sync {
    fn request_rebuild(&self, request: RebuildRequest);
}

impl RebuildRequester for UnboundedSender<RebuildRequest> {
    fn request_rebuild(&self, request: RebuildRequest) {
        if let Err(err) = self.send(request) {
            let request = err.0;
            let ticket = request.ticket;
            warn!(
                circuit = ticket.circuit,
                epoch = ticket.epoch,
                "Rebuild worker gone, failing rebuild"
            );
            if let Err(e) = request.complete(RebuildOutcome::Failed) {
                debug!(circuit = ticket.circuit, "Discarded rebuild failure: {e}");
            }
        }
    }
}

/// One rebuild to perform: close and reopen `ticket.circuit`, then report
/// the outcome exactly once.
#[derive(Debug)]
pub struct RebuildRequest {
    pub ticket: RebuildTicket,
    completer: RebuildCompleter,
}

impl RebuildRequest {
    pub fn complete(self, outcome: RebuildOutcome) -> Result<(), CmxError> {
        self.completer.complete(self.ticket, outcome)
    }
}

/// Reports rebuild outcomes back to the owning call without keeping it alive.
#[derive(Debug, Clone)]
pub struct RebuildCompleter {
    call_id: CallId,
    scheduler: Weak<Mutex<CircuitScheduler>>,
}

impl RebuildCompleter {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Apply a rebuild outcome. Fails with [`CmxError::CallEnded`] once the
    /// call has been dropped, and with [`CmxError::StaleRebuild`] for a
    /// superseded epoch; neither touches any scheduler state.
    pub fn complete(&self, ticket: RebuildTicket, outcome: RebuildOutcome) -> Result<(), CmxError> {
        let Some(inner) = self.scheduler.upgrade() else {
            debug!(
                call_id = %self.call_id,
                circuit = ticket.circuit,
                "Rebuild completed after call ended, discarding"
            );
            return Err(CmxError::CallEnded {
                call_id: self.call_id.to_string(),
            });
        };
        let mut scheduler = inner.lock().unwrap_or_else(PoisonError::into_inner);
        scheduler.complete_rebuild(ticket, outcome)
    }
}

#[derive(Clone)]
pub struct SharedScheduler {
    inner: Arc<Mutex<CircuitScheduler>>,
    call_id: CallId,
    requester: Option<Arc<dyn RebuildRequester>>,
}

impl std::fmt::Debug for SharedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedScheduler")
            .field("call_id", &self.call_id)
            .field("has_requester", &self.requester.is_some())
            .finish()
    }
}

impl SharedScheduler {
    pub fn new(scheduler: CircuitScheduler) -> Self {
        let call_id = scheduler.call_id();
        Self {
            inner: Arc::new(Mutex::new(scheduler)),
            call_id,
            requester: None,
        }
    }

    /// Route rebuild requests to the transport. Without a requester every
    /// rebuild is reported as failed immediately.
    pub fn with_requester(mut self, requester: Arc<dyn RebuildRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn completer(&self) -> RebuildCompleter {
        RebuildCompleter {
            call_id: self.call_id,
            scheduler: Arc::downgrade(&self.inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitScheduler> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the scheduler. Rebuilds started
    /// inside `f` are dispatched after the lock is released.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&mut CircuitScheduler) -> R) -> R {
        let (result, tickets) = {
            let mut scheduler = self.lock();
            let result = f(&mut scheduler);
            (result, scheduler.take_rebuild_requests())
        };
        self.dispatch(tickets);
        result
    }

    pub fn select_circuit(&self) -> CircuitIndex {
        self.lock().select_circuit()
    }

    pub fn report_send_success(&self, circuit: CircuitIndex) {
        self.lock().report_send_success(circuit);
    }

    pub fn report_send_failure(&self, circuit: CircuitIndex) {
        self.lock().report_send_failure(circuit);
    }

    pub fn report_late_to_buffer(&self, circuit: CircuitIndex, percent: f64) {
        self.lock().report_late_to_buffer(circuit, percent);
    }

    pub fn update_from_receiver_feedback<I>(&self, feedback: I)
    where
        I: IntoIterator<Item = (CircuitIndex, CircuitFeedback)>,
    {
        self.with_scheduler(|s| s.update_from_receiver_feedback(feedback));
    }

    pub fn update_from_late_percentages<I>(&self, late_percentages: I)
    where
        I: IntoIterator<Item = (CircuitIndex, f64)>,
    {
        self.with_scheduler(|s| s.update_from_late_percentages(late_percentages));
    }

    pub fn evaluate_circuit_rebuild(&self, circuit: CircuitIndex, late_to_buffer_percent: f64) {
        self.with_scheduler(|s| s.evaluate_circuit_rebuild(circuit, late_to_buffer_percent));
    }

    pub fn check_quarantine_recovery(&self, circuit: CircuitIndex) {
        self.with_scheduler(|s| s.check_quarantine_recovery(circuit));
    }

    pub fn on_circuit_rebuilt(&self, circuit: CircuitIndex, epoch: u32) -> Result<(), CmxError> {
        self.lock().on_circuit_rebuilt(circuit, epoch)
    }

    /// No-op unless `circuit` has a rebuild in flight.
    pub fn on_circuit_rebuild_failed(&self, circuit: CircuitIndex) {
        self.lock().on_circuit_rebuild_failed(circuit);
    }

    pub fn complete_rebuild(
        &self,
        ticket: RebuildTicket,
        outcome: RebuildOutcome,
    ) -> Result<(), CmxError> {
        self.lock().complete_rebuild(ticket, outcome)
    }

    pub fn get_circuit_stats(&self) -> Vec<CircuitStats> {
        self.lock().get_circuit_stats()
    }

    pub fn health_snapshot(&self) -> Vec<CircuitHealthSnapshot> {
        self.lock().health_snapshot()
    }

    pub fn current_phase(&self) -> CallPhase {
        self.lock().current_phase()
    }

    pub fn call_elapsed(&self) -> Duration {
        self.lock().call_elapsed()
    }

    pub fn rebuild_in_flight(&self) -> Option<RebuildTicket> {
        self.lock().rebuild_in_flight()
    }

    fn dispatch(&self, tickets: Vec<RebuildTicket>) {
        for ticket in tickets {
            let request = RebuildRequest {
                ticket,
                completer: self.completer(),
            };
            match &self.requester {
                Some(requester) => requester.request_rebuild(request),
                None => {
                    warn!(
                        circuit = ticket.circuit,
                        epoch = ticket.epoch,
                        "No rebuild requester attached, failing rebuild"
                    );
                    if let Err(e) = request.complete(RebuildOutcome::Failed) {
                        debug!(circuit = ticket.circuit, "Discarded rebuild failure: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "shared_tests.rs"]
mod tests;
