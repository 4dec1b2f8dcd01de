//! Buffer configuration types.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::checkpoint::GlobalCheckpointPolicy;

/// Tunables for the buffer, its memory budget, and the flush worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Total bytes buffered items may hold, e.g. `"256mb"`.
    #[serde(default = "default_memory_budget")]
    pub memory_budget: String,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_worker_idle_poll_interval_ms")]
    pub worker_idle_poll_interval_ms: u64,
    #[serde(default = "default_shutdown_drain_timeout_secs")]
    pub shutdown_drain_timeout_secs: u64,
    /// Queues whose head record is older than this are flushed even when
    /// below the size threshold.
    #[serde(default = "default_max_time_between_flushes_secs")]
    pub max_time_between_flushes_secs: u64,
    /// Fraction of the budget above which undersized queues are flushed.
    #[serde(default = "default_memory_pressure_ratio")]
    pub memory_pressure_ratio: f64,
    /// Namespace applied to stream keys that arrive without one.
    #[serde(default)]
    pub default_namespace: Option<String>,
    #[serde(default)]
    pub global_checkpoint_policy: GlobalCheckpointPolicy,
}

fn default_memory_budget() -> String {
    "256mb".to_string()
}
fn default_worker_pool_size() -> usize {
    5
}
fn default_worker_idle_poll_interval_ms() -> u64 {
    10
}
fn default_shutdown_drain_timeout_secs() -> u64 {
    60
}
fn default_max_time_between_flushes_secs() -> u64 {
    300
}
fn default_memory_pressure_ratio() -> f64 {
    crate::memory::DEFAULT_PRESSURE_RATIO
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_budget: default_memory_budget(),
            worker_pool_size: default_worker_pool_size(),
            worker_idle_poll_interval_ms: default_worker_idle_poll_interval_ms(),
            shutdown_drain_timeout_secs: default_shutdown_drain_timeout_secs(),
            max_time_between_flushes_secs: default_max_time_between_flushes_secs(),
            memory_pressure_ratio: default_memory_pressure_ratio(),
            default_namespace: None,
            global_checkpoint_policy: GlobalCheckpointPolicy::default(),
        }
    }
}

impl BufferConfig {
    /// The memory budget in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `memory_budget` is not a valid byte size.
    pub fn memory_budget_bytes(&self) -> Result<u64> {
        parse_byte_size(&self.memory_budget)
            .with_context(|| format!("Invalid memory_budget '{}'", self.memory_budget))
    }

    #[must_use]
    pub fn worker_idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_idle_poll_interval_ms)
    }

    #[must_use]
    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_timeout_secs)
    }

    #[must_use]
    pub fn max_time_between_flushes(&self) -> Duration {
        Duration::from_secs(self.max_time_between_flushes_secs)
    }
}

/// Parse a human byte size such as `"64kb"`, `"256mb"`, `"1gb"` or `"4096"`.
/// Units are binary (1kb = 1024 bytes) and case-insensitive.
///
/// # Errors
///
/// Returns an error for an empty string, an unknown unit, a non-numeric
/// value, or a size that overflows `u64`.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        bail!("empty byte size");
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        bail!("byte size '{input}' has no numeric value");
    }
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid byte size '{input}'"))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        other => bail!("unknown byte size unit '{other}' in '{input}'"),
    };
    value
        .checked_mul(multiplier)
        .with_context(|| format!("byte size '{input}' overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("4096", 4096)]
    #[case("512b", 512)]
    #[case("64kb", 64 * 1024)]
    #[case("256mb", 256 * 1024 * 1024)]
    #[case("1gb", 1024 * 1024 * 1024)]
    #[case(" 2MB ", 2 * 1024 * 1024)]
    #[case("8 kb", 8 * 1024)]
    fn test_parse_byte_size_valid(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_byte_size(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("mb")]
    #[case("12tb")]
    #[case("-5mb")]
    #[case("1.5gb")]
    #[case("99999999999999999999gb")]
    fn test_parse_byte_size_invalid(#[case] input: &str) {
        assert!(parse_byte_size(input).is_err(), "accepted {input:?}");
    }

    #[test]
    fn test_defaults() {
        let config = BufferConfig::default();
        assert_eq!(config.memory_budget_bytes().unwrap(), 256 * 1024 * 1024);
        assert_eq!(config.worker_pool_size, 5);
        assert_eq!(config.worker_idle_poll_interval(), Duration::from_millis(10));
        assert_eq!(config.shutdown_drain_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_time_between_flushes(), Duration::from_secs(300));
        assert!((config.memory_pressure_ratio - 0.9).abs() < f64::EPSILON);
        assert_eq!(
            config.global_checkpoint_policy,
            GlobalCheckpointPolicy::AllStreams
        );
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: BufferConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, BufferConfig::default());
    }

    #[test]
    fn test_deserialize_overrides() {
        let yaml = r"
memory_budget: 64mb
worker_pool_size: 2
default_namespace: analytics
global_checkpoint_policy: listed_streams
";
        let config: BufferConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.memory_budget_bytes().unwrap(), 64 * 1024 * 1024);
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.default_namespace.as_deref(), Some("analytics"));
        assert_eq!(
            config.global_checkpoint_policy,
            GlobalCheckpointPolicy::ListedStreams
        );
        assert_eq!(config.worker_idle_poll_interval_ms, 10);
    }

    #[test]
    fn test_invalid_budget_reports_field() {
        let config = BufferConfig {
            memory_budget: "lots".to_string(),
            ..BufferConfig::default()
        };
        let err = format!("{:#}", config.memory_budget_bytes().unwrap_err());
        assert!(err.contains("memory_budget"), "got: {err}");
    }
}
