//! Virtual circuits for `cmx simulate`.
//!
//! Each circuit drops frames and fails local sends with fixed probabilities.
//! A successful rebuild replaces the circuit with a fresh path whose loss is
//! drawn from the healthy range and whose receive counter starts at zero.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, MutexGuard, PoisonError};

use cmx_core::{CircuitFeedback, CircuitIndex};

/// Upper bound for the loss rate of a freshly rebuilt path.
const REBUILT_MAX_LOSS: f64 = 0.02;
/// Share of lost frames the receiver conceals with PLC.
const PLC_SHARE_OF_LOSS: f64 = 0.8;

/// Transport-side circuit control used by the rebuild worker.
#[async_trait]
pub trait CircuitTransport: Send + Sync {
    /// Tear down `circuit` and open a new path. Returns `true` on success.
    async fn reconnect(&self, circuit: CircuitIndex, epoch: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    SendFailed,
    Lost,
    Delivered,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualCircuit {
    pub loss: f64,
    pub send_failure: f64,
    /// Frames handed to the circuit since the last feedback message.
    sent_window: u64,
    lost_window: u64,
    /// Missing percentage of the last window that carried traffic.
    last_missing: f64,
    /// Peer-side absolute receive counter for the current path.
    received_total: u64,
    pub reconnects: u32,
}

#[derive(Debug)]
struct NetworkState {
    circuits: Vec<VirtualCircuit>,
    rng: StdRng,
}

#[derive(Debug)]
pub struct SimulatedNetwork {
    state: Mutex<NetworkState>,
    rebuild_success: f64,
}

impl SimulatedNetwork {
    pub fn new(
        loss: &[f64],
        send_failure: &[f64],
        num_circuits: usize,
        rebuild_success: f64,
        seed: Option<u64>,
    ) -> Self {
        let circuits = (0..num_circuits)
            .map(|i| VirtualCircuit {
                loss: loss.get(i).copied().unwrap_or(0.0),
                send_failure: send_failure.get(i).copied().unwrap_or(0.0),
                ..VirtualCircuit::default()
            })
            .collect();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: Mutex::new(NetworkState { circuits, rng }),
            rebuild_success,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push one frame through `circuit`.
    pub fn transmit(&self, circuit: CircuitIndex) -> Transmit {
        let mut state = self.lock();
        let NetworkState { circuits, rng } = &mut *state;
        let Some(c) = circuits.get_mut(circuit) else {
            return Transmit::SendFailed;
        };
        if rng.gen_range(0.0..1.0) < c.send_failure {
            return Transmit::SendFailed;
        }
        c.sent_window += 1;
        if rng.gen_range(0.0..1.0) < c.loss {
            c.lost_window += 1;
            Transmit::Lost
        } else {
            c.received_total += 1;
            Transmit::Delivered
        }
    }

    /// The peer's view of the last window, per circuit. Resets the window.
    pub fn take_feedback(&self) -> Vec<(CircuitIndex, CircuitFeedback)> {
        let mut state = self.lock();
        let NetworkState { circuits, rng } = &mut *state;
        circuits
            .iter_mut()
            .enumerate()
            .map(|(i, c)| {
                // An idle window carries no new information for the receiver.
                if c.sent_window > 0 {
                    c.last_missing = c.lost_window as f64 * 100.0 / c.sent_window as f64;
                }
                let missing = c.last_missing;
                let jitter_late = rng.gen_range(0.0..2.0);
                c.sent_window = 0;
                c.lost_window = 0;
                (
                    i,
                    CircuitFeedback {
                        late_percent: jitter_late + missing * 0.2,
                        missing_percent: missing,
                        plc_percent: missing * PLC_SHARE_OF_LOSS,
                        frames_received: c.received_total,
                    },
                )
            })
            .collect()
    }

    pub fn circuits(&self) -> Vec<VirtualCircuit> {
        self.lock().circuits.clone()
    }
}

#[async_trait]
impl CircuitTransport for SimulatedNetwork {
    async fn reconnect(&self, circuit: CircuitIndex, epoch: u32) -> bool {
        let mut state = self.lock();
        let NetworkState { circuits, rng } = &mut *state;
        let succeeded = rng.gen_range(0.0..1.0) < self.rebuild_success;
        let Some(c) = circuits.get_mut(circuit) else {
            return false;
        };
        if succeeded {
            c.loss = rng.gen_range(0.0..REBUILT_MAX_LOSS);
            c.sent_window = 0;
            c.lost_window = 0;
            c.last_missing = 0.0;
            c.received_total = 0;
            c.reconnects += 1;
        }
        tracing::debug!(circuit, epoch, succeeded, loss = c.loss, "Simulated reconnect");
        succeeded
    }
}
