//! Pure pieces of circuit selection: burst bookkeeping, rank weighting and
//! the cumulative-weight draw.

use cmx_core::CircuitIndex;

/// Current micro-burst: consecutive frames pinned to one circuit, which keeps
/// mid-burst switching from reordering frames at the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Burst {
    pub circuit: CircuitIndex,
    pub frames: u32,
}

impl Burst {
    /// Take one more frame from the running burst, if it has room.
    pub fn try_continue(&mut self, burst_size: u32) -> Option<CircuitIndex> {
        if self.frames < burst_size {
            self.frames += 1;
            Some(self.circuit)
        } else {
            None
        }
    }

    pub fn restart(&mut self, circuit: CircuitIndex) {
        self.circuit = circuit;
        self.frames = 1;
    }

    /// Force the next call to reselect.
    pub fn end(&mut self) {
        self.frames = u32::MAX;
    }
}

/// Effective weights for circuits ranked best-first: rank base weight times
/// ramp weight, normalized to sum to 1. Falls back to uniform when every
/// effective weight is zero.
pub fn normalized_weights(rank_weights: &[f64], ramp_weights: &[f64]) -> Vec<f64> {
    let effective: Vec<f64> = ramp_weights
        .iter()
        .enumerate()
        .map(|(rank, ramp)| rank_weights.get(rank).copied().unwrap_or(0.0) * ramp)
        .collect();
    let total: f64 = effective.iter().sum();
    if total > 0.0 {
        effective.into_iter().map(|w| w / total).collect()
    } else {
        let n = ramp_weights.len().max(1) as f64;
        vec![1.0 / n; ramp_weights.len()]
    }
}

/// Cumulative-weight search for a uniform draw in `[0, 1)`. Returns a
/// position into `weights`; falls back to 0 on rounding shortfall.
pub fn pick_weighted(weights: &[f64], draw: f64) -> usize {
    let mut cumulative = 0.0;
    for (pos, w) in weights.iter().enumerate() {
        cumulative += w;
        if draw < cumulative {
            return pos;
        }
    }
    0
}
