use anyhow::{Result, bail};

use crate::config::{CooldownConfig, PhaseConfig, RebuildConfig, SchedulerConfig, SelectionConfig};

/// Validate a scheduler configuration.
/// Returns Ok(()) if valid, or Err with a message naming the offending key.
pub fn validate_config(config: &SchedulerConfig) -> Result<()> {
    if config.num_circuits == 0 {
        bail!("num_circuits must be >= 1 (got 0)");
    }
    validate_selection(&config.selection)?;
    validate_phases(&config.phases)?;
    validate_cooldown(&config.cooldown)?;
    validate_rebuild(&config.rebuild)?;
    warn_unused_rank_weights(config);
    Ok(())
}

fn validate_selection(selection: &SelectionConfig) -> Result<()> {
    if selection.burst_size == 0 {
        bail!("selection.burst_size must be > 0 (got 0)");
    }
    if selection.rank_weights.is_empty() {
        bail!("selection.rank_weights cannot be empty");
    }
    if let Some(w) = selection
        .rank_weights
        .iter()
        .find(|w| !w.is_finite() || **w < 0.0)
    {
        bail!("selection.rank_weights must be finite and >= 0 (got {w})");
    }
    if selection.rank_weights[0] <= 0.0 {
        bail!("selection.rank_weights[0] must be > 0 so the best circuit is selectable");
    }
    if !(selection.min_circuit_weight > 0.0 && selection.min_circuit_weight <= 1.0) {
        bail!(
            "selection.min_circuit_weight must be in (0, 1] (got {})",
            selection.min_circuit_weight
        );
    }
    Ok(())
}

fn validate_phases(phases: &PhaseConfig) -> Result<()> {
    if !(phases.establishment_ms <= phases.warmup_ms && phases.warmup_ms <= phases.relaxed_ms) {
        bail!(
            "phase boundaries must be non-decreasing: establishment_ms ({}) <= warmup_ms ({}) <= relaxed_ms ({})",
            phases.establishment_ms,
            phases.warmup_ms,
            phases.relaxed_ms
        );
    }
    Ok(())
}

fn validate_cooldown(cooldown: &CooldownConfig) -> Result<()> {
    if cooldown.duration_ms == 0 {
        bail!("cooldown.duration_ms must be > 0 (got 0)");
    }
    if cooldown.send_failure_threshold == 0 {
        bail!("cooldown.send_failure_threshold must be > 0 (got 0)");
    }
    if cooldown.ramp_factor <= 1.0 || !cooldown.ramp_factor.is_finite() {
        bail!(
            "cooldown.ramp_factor must be > 1.0 (got {}); a recovering circuit would never ramp back",
            cooldown.ramp_factor
        );
    }
    for (key, rate) in [
        ("relaxed_delivery_rate", cooldown.relaxed_delivery_rate),
        ("strict_delivery_rate", cooldown.strict_delivery_rate),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            bail!("cooldown.{key} must be in [0, 1] (got {rate})");
        }
    }
    for (key, pct) in [
        ("relaxed_missing_percent", cooldown.relaxed_missing_percent),
        ("relaxed_plc_percent", cooldown.relaxed_plc_percent),
        ("strict_missing_percent", cooldown.strict_missing_percent),
        ("strict_plc_percent", cooldown.strict_plc_percent),
        ("delivery_plc_gate", cooldown.delivery_plc_gate),
        ("clean_missing_percent", cooldown.clean_missing_percent),
        ("clean_plc_percent", cooldown.clean_plc_percent),
        ("clean_late_percent", cooldown.clean_late_percent),
    ] {
        check_percent("cooldown", key, pct)?;
    }
    Ok(())
}

fn validate_rebuild(rebuild: &RebuildConfig) -> Result<()> {
    if rebuild.bad_windows_to_quarantine == 0 {
        bail!("rebuild.bad_windows_to_quarantine must be > 0 (got 0)");
    }
    if rebuild.initial_backoff_ms == 0 {
        bail!("rebuild.initial_backoff_ms must be > 0 (got 0)");
    }
    if rebuild.max_backoff_ms < rebuild.initial_backoff_ms {
        bail!(
            "rebuild.max_backoff_ms ({}) must be >= rebuild.initial_backoff_ms ({})",
            rebuild.max_backoff_ms,
            rebuild.initial_backoff_ms
        );
    }
    for (key, pct) in [
        ("severe_plc_percent", rebuild.severe_plc_percent),
        ("combined_plc_percent", rebuild.combined_plc_percent),
        ("combined_missing_percent", rebuild.combined_missing_percent),
        ("network_plc_percent", rebuild.network_plc_percent),
        (
            "network_late_to_buffer_percent",
            rebuild.network_late_to_buffer_percent,
        ),
    ] {
        check_percent("rebuild", key, pct)?;
    }
    Ok(())
}

fn check_percent(section: &str, key: &str, value: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&value) {
        bail!("{section}.{key} must be a percentage in [0, 100] (got {value})");
    }
    Ok(())
}

fn warn_unused_rank_weights(config: &SchedulerConfig) {
    let extra = config
        .selection
        .rank_weights
        .len()
        .saturating_sub(config.num_circuits);
    if extra > 0 {
        tracing::warn!(
            extra,
            num_circuits = config.num_circuits,
            "selection.rank_weights has more entries than circuits; extras are unused"
        );
    }
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
