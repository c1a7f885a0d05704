pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CmxError;
pub use types::{
    CallId, CallPhase, CircuitFeedback, CircuitIndex, CircuitStats, CooldownReason, OutputFormat,
    RebuildOutcome, RebuildTicket,
};
