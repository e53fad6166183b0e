//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared across all requests
//! - Synchronous: guests run to completion on a blocking worker
//! - Set up with epoch interruption (and optionally fuel) for resource limiting

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use wagi_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// This struct wraps a Wasmtime [`Engine`] and contains no per-request
/// state. Cloning is cheap.
///
/// # Configuration
///
/// - **Epoch Interruption**: Enables the wall-clock execution guard
/// - **Fuel Metering**: Optional deterministic CPU limiting
/// - **Compilation Cache**: Optional on-disk cache from a wasmtime cache
///   configuration file
/// - **Pooling Allocator**: Optional, for hosts with many small guests
///
/// # Example
///
/// ```ignore
/// use wagi_common::EngineConfig;
/// use wagi_core::WasmEngine;
///
/// let config = EngineConfig::default();
/// let engine = WasmEngine::new(&config)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The cache configuration file is missing or invalid
    /// - The pooling allocator cannot be initialized
    /// - The Wasmtime configuration is otherwise invalid
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.consume_fuel(config.consume_fuel);
        wasmtime_config.epoch_interruption(config.epoch_interruption);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        if let Some(ref cache_config) = config.cache_config_path {
            if !cache_config.is_file() {
                return Err(RuntimeError::invalid_config(format!(
                    "Cache configuration file {} does not exist",
                    cache_config.display()
                )));
            }

            wasmtime_config
                .cache_config_load(cache_config)
                .map_err(|e| {
                    RuntimeError::invalid_config(format!(
                        "Failed to load cache configuration {}: {e}",
                        cache_config.display()
                    ))
                })?;

            debug!(cache_config = %cache_config.display(), "Module caching configured");
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Spawn a background thread that advances the epoch every `tick`.
    ///
    /// The thread stops when the returned [`EpochTicker`] is dropped. Returns
    /// `None` when epoch interruption is disabled.
    pub fn start_epoch_ticker(&self, tick: Duration) -> Option<EpochTicker> {
        if !self.config.epoch_interruption {
            return None;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::downgrade(&self.engine);
        let flag = Arc::clone(&stop);

        let spawned = std::thread::Builder::new()
            .name("wagi-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    engine.increment_epoch();
                }
            });

        match spawned {
            Ok(_) => {
                debug!(tick_ms = tick.as_millis(), "Epoch ticker started");
                Some(EpochTicker { stop })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start epoch ticker");
                None
            }
        }
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("consume_fuel", &self.config.consume_fuel)
            .finish_non_exhaustive()
    }
}

/// Stops the epoch ticker thread on drop.
#[derive(Debug)]
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
