//! HTTP server implementation.
//!
//! This module provides the main [`WagiServer`] struct for running
//! the WAGI HTTP server.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use wagi_common::{RuntimeConfig, RuntimeError, ServerConfigFile, WagiConfig};

use crate::router::build_router;
use crate::state::AppState;
use crate::watcher::{ConfigSource, ConfigWatcher, DEFAULT_DEBOUNCE};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Largest request body accepted, in bytes.
    pub max_body_bytes: usize,
    /// Configuration to watch for changes, if any.
    pub watch: Option<ConfigSource>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            request_timeout_secs: 60,
            graceful_shutdown: true,
            max_body_bytes: 16 * 1024 * 1024,
            watch: None,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` section of a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if `bind_addr` is not a socket address.
    pub fn from_file(file: &ServerConfigFile) -> Result<Self, RuntimeError> {
        let bind_addr = file.bind_addr.parse().map_err(|e| {
            RuntimeError::invalid_config(format!("Invalid bind address {}: {e}", file.bind_addr))
        })?;

        Ok(Self {
            bind_addr,
            request_timeout_secs: file.request_timeout_secs,
            graceful_shutdown: file.graceful_shutdown,
            max_body_bytes: file.max_body_bytes,
            watch: None,
        })
    }

    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Rebuild routes whenever `source` changes.
    #[must_use]
    pub fn with_watch(mut self, source: ConfigSource) -> Self {
        self.watch = Some(source);
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// WAGI HTTP server.
///
/// # Example
///
/// ```ignore
/// use wagi_server::{ServerConfig, WagiServer};
/// use wagi_common::{RuntimeConfig, WagiConfig};
///
/// let wagi = WagiConfig::from_modules_toml_file("modules.toml")?;
/// let server = WagiServer::new(&RuntimeConfig::default(), &wagi, ServerConfig::default())?;
///
/// server.state().rebuild(wagi).await?;
/// server.run().await?;
/// ```
pub struct WagiServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
    /// Execution settings, for the epoch ticker.
    runtime: RuntimeConfig,
}

impl WagiServer {
    /// Create a new server instance with an empty route table.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be initialized.
    pub fn new(
        runtime_config: &RuntimeConfig,
        wagi_config: &WagiConfig,
        server_config: ServerConfig,
    ) -> Result<Self, RuntimeError> {
        let state = AppState::new(runtime_config, wagi_config, server_config.max_body_bytes)?;

        Ok(Self {
            state,
            config: server_config,
            runtime: runtime_config.clone(),
        })
    }

    /// Get a reference to the application state.
    ///
    /// Use this to build the route table before starting the server.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// This will block until the server is shut down via signal
    /// (SIGTERM/SIGINT) if graceful shutdown is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let _ticker = self
            .state
            .start_epoch_ticker(self.runtime.execution.epoch_tick());

        let _watcher = match &self.config.watch {
            Some(source) => {
                match ConfigWatcher::spawn(self.state.clone(), source.clone(), DEFAULT_DEBOUNCE) {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        warn!(error = %e, "Configuration reload disabled");
                        None
                    }
                }
            }
            None => None,
        };

        let app = build_router(self.state, self.config.request_timeout())
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        } else {
            axum::serve(listener, app).await?;
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0), serves the
    /// routes built from `wagi_config`, and returns a handle that can be
    /// used to get the actual address and shut down the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or binding fails.
    pub async fn start_test(
        runtime_config: &RuntimeConfig,
        wagi_config: WagiConfig,
    ) -> Result<TestHandle, RuntimeError> {
        let state = AppState::new(
            runtime_config,
            &wagi_config,
            ServerConfig::default().max_body_bytes,
        )?;
        state.rebuild(wagi_config).await?;
        let ticker = state.start_epoch_ticker(runtime_config.execution.epoch_tick());

        let app = build_router(state.clone(), Duration::from_secs(30))
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
            _ticker: ticker,
        })
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state (for rebuilding routes).
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
    /// Keeps execution timeouts running.
    _ticker: Option<wagi_core::EpochTicker>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// If a handler cannot be installed, that signal is never awaited.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
