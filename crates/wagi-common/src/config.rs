//! Runtime configuration structures.
//!
//! This module defines configuration options for the execution engine:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, compilation cache)
//! - [`ExecutionConfig`]: Per-request execution limits (timeout, fuel, header size)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// It can be loaded from the `[runtime]` section of a TOML or JSON
/// configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-request execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Wasmtime engine configuration.
///
/// These settings are applied once, when the shared engine is created.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator for instance creation.
    ///
    /// WAGI guests are often interpreters with large heaps, so this is
    /// off by default.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Path to a wasmtime cache configuration file.
    ///
    /// When set, compiled artifacts are cached on disk as described by that
    /// file. The file must exist.
    #[serde(default)]
    pub cache_config_path: Option<PathBuf>,

    /// Enable epoch-based interruption.
    ///
    /// Required for `ExecutionConfig::timeout_ms` to have any effect.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Enable fuel metering.
    ///
    /// When enabled, each store is given `ExecutionConfig::max_fuel`.
    #[serde(default = "defaults::consume_fuel")]
    pub consume_fuel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            cache_config_path: None,
            epoch_interruption: defaults::epoch_interruption(),
            consume_fuel: defaults::consume_fuel(),
        }
    }
}

/// Per-request execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum wall-clock duration of one guest invocation in milliseconds.
    ///
    /// Zero disables the guard.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Maximum fuel per request when fuel metering is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Longest header line a guest may write before the response is rejected.
    #[serde(default = "defaults::max_header_bytes")]
    pub max_header_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            max_fuel: defaults::max_fuel(),
            max_header_bytes: defaults::max_header_bytes(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`, or `None` if disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }

    /// Number of epoch ticks a store may run before it is interrupted.
    pub fn deadline_ticks(&self) -> u64 {
        self.timeout_ms.div_ceil(self.epoch_tick_ms.max(1)).max(1)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        256
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn consume_fuel() -> bool {
        false
    }

    pub const fn timeout_ms() -> u64 {
        30_000
    }

    pub const fn epoch_tick_ms() -> u64 {
        10
    }

    pub const fn max_fuel() -> u64 {
        10_000_000_000
    }

    pub const fn max_header_bytes() -> usize {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(!config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert!(config.engine.cache_config_path.is_none());
        assert!(config.engine.epoch_interruption);
        assert!(!config.engine.consume_fuel);

        assert_eq!(config.execution.timeout_ms, 30_000);
        assert_eq!(config.execution.max_header_bytes, 1024);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.engine.max_instances,
            deserialized.engine.max_instances
        );
        assert_eq!(config.execution.max_fuel, deserialized.execution.max_fuel);
    }

    #[test]
    fn test_execution_timeout() {
        let config = ExecutionConfig {
            timeout_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.timeout(), Some(Duration::from_millis(500)));

        let disabled = ExecutionConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(disabled.timeout().is_none());
    }

    #[test]
    fn test_deadline_ticks_round_up() {
        let config = ExecutionConfig {
            timeout_ms: 25,
            epoch_tick_ms: 10,
            ..Default::default()
        };
        assert_eq!(config.deadline_ticks(), 3);

        let zero_tick = ExecutionConfig {
            timeout_ms: 5,
            epoch_tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(zero_tick.deadline_ticks(), 5);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"engine": {"cache_config_path": "cache.toml"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(
            config.engine.cache_config_path,
            Some(PathBuf::from("cache.toml"))
        );
        // Default values for unspecified fields
        assert!(config.engine.epoch_interruption);
        assert_eq!(config.execution.timeout_ms, 30_000);
    }
}
