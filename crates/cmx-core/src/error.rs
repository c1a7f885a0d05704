#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CmxError {
    #[error("Circuit index {index} out of range (circuit count: {count})")]
    CircuitOutOfRange { index: usize, count: usize },

    #[error("Invalid circuit count {0}: at least one circuit is required")]
    InvalidCircuitCount(usize),

    #[error("Stale rebuild completion for circuit {circuit}: epoch {epoch}, current epoch {current}")]
    StaleRebuild {
        circuit: usize,
        epoch: u32,
        current: u32,
    },

    #[error("Call {call_id} has ended")]
    CallEnded { call_id: String },

    #[error("Rebuild ticket belongs to call {ticket_call}, not {call_id}")]
    ForeignCall { ticket_call: String, call_id: String },

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}
