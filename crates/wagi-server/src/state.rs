//! Shared application state.
//!
//! This module provides [`AppState`], which holds shared resources
//! across all HTTP request handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use reqwest::Client;
use tracing::{error, info, instrument};

use wagi_common::{RuntimeConfig, RuntimeError, WagiConfig};
use wagi_core::{InstanceRunner, ModuleResolver, WagiHost, WasmEngine};

use crate::bindle::{self, BindleResolver};
use crate::routes::RouteTable;

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// Module execution (engine, module cache, instance runner).
    host: Arc<WagiHost>,

    /// Current route table; replaced whole on rebuild.
    routes: Arc<ArcSwap<RouteTable>>,

    /// Number of route tables published since startup.
    generation: Arc<AtomicU64>,

    /// Largest request body accepted, in bytes.
    max_body_bytes: usize,
}

impl AppState {
    /// Create application state with an empty route table.
    ///
    /// A `cache_config_path` in `wagi` takes precedence over the engine's.
    ///
    /// # Errors
    ///
    /// Returns an error if engine, runner or HTTP client creation fails.
    pub fn new(
        runtime: &RuntimeConfig,
        wagi: &WagiConfig,
        max_body_bytes: usize,
    ) -> Result<Self, RuntimeError> {
        let mut engine_config = runtime.engine.clone();
        if let Some(path) = &wagi.cache_config_path {
            engine_config.cache_config_path = Some(path.clone());
        }

        let engine = WasmEngine::new(&engine_config)?;
        let resolver = Arc::new(ModuleResolver::new(engine.clone()));
        let runner = InstanceRunner::new(engine, runtime.execution.clone())?;
        let client = wagi_host::HttpProxy::default_client().map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            host: Arc::new(WagiHost::new(resolver, runner, client)),
            routes: Arc::new(ArcSwap::from_pointee(RouteTable::new())),
            generation: Arc::new(AtomicU64::new(0)),
            max_body_bytes,
        })
    }

    /// Module execution.
    pub fn host(&self) -> &Arc<WagiHost> {
        &self.host
    }

    /// The shared engine.
    pub fn engine(&self) -> &WasmEngine {
        self.host.runner().engine()
    }

    /// The HTTP client used for outbound requests and bindles.
    pub fn client(&self) -> &Client {
        self.host.client()
    }

    /// Largest request body accepted.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// A snapshot of the current route table.
    ///
    /// The snapshot stays valid after a rebuild replaces the table.
    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Publish a new route table.
    pub fn swap_routes(&self, table: RouteTable) {
        self.routes.store(Arc::new(table));
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// How many route tables have been published.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Validate `config`, build a route table from it and publish it.
    ///
    /// On a validation error the current table is kept. Returns the number
    /// of routes published.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the configuration is invalid.
    pub async fn rebuild(&self, config: WagiConfig) -> Result<usize, RuntimeError> {
        let bindles = bindle::resolver_for(&config, self.client());
        self.rebuild_with(config, bindles).await
    }

    /// Like [`AppState::rebuild`], resolving bindles through `bindles`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the configuration is invalid.
    #[instrument(skip_all)]
    pub async fn rebuild_with(
        &self,
        config: WagiConfig,
        bindles: Arc<dyn BindleResolver>,
    ) -> Result<usize, RuntimeError> {
        config.validate()?;

        let host = Arc::clone(&self.host);
        let table = tokio::task::spawn_blocking(move || {
            RouteTable::build(&config, &host, bindles.as_ref())
        })
        .await
        .map_err(|e| RuntimeError::invalid_config(format!("Route table build failed: {e}")))?;

        let count = table.len();
        self.swap_routes(table);
        info!(routes = count, "Route table published");
        Ok(count)
    }

    /// Rebuild, logging instead of returning a failure.
    pub async fn reload(&self, config: WagiConfig) {
        if let Err(e) = self.rebuild(config).await {
            error!(error = %e, "Configuration rejected, keeping current routes");
        }
    }

    /// Start the epoch ticker for execution timeouts.
    pub fn start_epoch_ticker(&self, tick: Duration) -> Option<wagi_core::EpochTicker> {
        self.engine().start_epoch_ticker(tick)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("routes_count", &self.routes.load().len())
            .field("generation", &self.generation())
            .field("modules_cached", &self.host.resolver().len())
            .finish_non_exhaustive()
    }
}
