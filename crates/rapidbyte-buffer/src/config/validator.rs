//! Semantic validation for parsed buffer configuration values.

use anyhow::{bail, Result};

use crate::config::types::BufferConfig;

/// Validate a parsed buffer configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the config.
pub fn validate_buffer_config(config: &BufferConfig) -> Result<()> {
    let mut errors = Vec::new();

    match config.memory_budget_bytes() {
        Ok(0) => errors.push("memory_budget must be greater than zero".to_string()),
        Ok(_) => {}
        Err(e) => errors.push(format!("{e:#}")),
    }

    if config.worker_pool_size == 0 {
        errors.push("worker_pool_size must be at least 1".to_string());
    }

    if config.worker_idle_poll_interval_ms == 0 {
        errors.push("worker_idle_poll_interval_ms must be > 0".to_string());
    }

    if config.shutdown_drain_timeout_secs == 0 {
        errors.push("shutdown_drain_timeout_secs must be > 0".to_string());
    }

    if config.max_time_between_flushes_secs == 0 {
        errors.push("max_time_between_flushes_secs must be > 0".to_string());
    }

    if !(config.memory_pressure_ratio > 0.0 && config.memory_pressure_ratio <= 1.0) {
        errors.push(format!(
            "memory_pressure_ratio must be in (0, 1], got {}",
            config.memory_pressure_ratio
        ));
    }

    if let Some(ns) = &config.default_namespace {
        if ns.trim().is_empty() {
            errors.push("default_namespace must not be blank when set".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Buffer config validation failed:\n  - {}", errors.join("\n  - "));
    }
}
