//! Scheduler configuration loading and validation (`~/.config/circuit-mux/config.toml`).

pub mod config;
pub mod validate;

pub use config::{
    CooldownConfig, PhaseConfig, RebuildConfig, SchedulerConfig, SelectionConfig,
};
pub use validate::validate_config;
