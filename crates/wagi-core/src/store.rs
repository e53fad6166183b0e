//! Per-request execution context and store management.
//!
//! This module provides:
//! - [`ExecutionContext`]: The process interface a guest runs with (environment,
//!   argv, preopened volumes, stdio conduits)
//! - [`WorkerContext`]: Per-instance store data reachable from host functions
//! - [`create_store`]: Store construction with the configured resource limits

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, error};
use wasmtime::Store;
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, InputFile, OutputFile, WasiCtxBuilder};

use wagi_common::{ExecutionConfig, RuntimeError, WasiError};
use wagi_host::HttpProxy;

use crate::WasmEngine;
use crate::cgi::CgiEnvironment;
use crate::temp::TempResource;

/// The process interface of one guest invocation.
///
/// All three stdio conduits are temporary files, removed when the context (or,
/// for stdout, the response body that takes it over) is dropped.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Environment variables.
    pub env: CgiEnvironment,

    /// Program arguments.
    pub args: Vec<String>,

    /// Host directory to guest path mappings.
    pub preopens: Vec<(PathBuf, String)>,

    /// Guest stdin, holding the request body.
    pub stdin: TempResource,

    /// Guest stdout.
    pub stdout: TempResource,

    /// Guest stderr.
    pub stderr: TempResource,
}

impl ExecutionContext {
    /// Create a context with `body` written to a fresh stdin file and empty
    /// stdout and stderr files.
    ///
    /// # Errors
    ///
    /// Returns an error if a temporary file cannot be created or written.
    pub fn new(env: CgiEnvironment, args: Vec<String>, body: &Bytes) -> Result<Self, RuntimeError> {
        let stdin = TempResource::new()?;
        let mut writer = stdin.handle()?;
        writer.write_all(body)?;
        writer.flush()?;

        Ok(Self {
            env,
            args,
            preopens: Vec::new(),
            stdin,
            stdout: TempResource::new()?,
            stderr: TempResource::new()?,
        })
    }

    /// Add environment entries, replacing variables of the same name.
    #[must_use]
    pub fn with_environment(mut self, environment: &BTreeMap<String, String>) -> Self {
        for (key, value) in environment {
            self.env.set(key.as_str(), value.as_str());
        }
        self
    }

    /// Map host directories into the guest.
    ///
    /// A host directory that does not exist is logged and skipped.
    #[must_use]
    pub fn with_volumes(mut self, volumes: &BTreeMap<String, String>) -> Self {
        for (guest, host) in volumes {
            let host_path = PathBuf::from(host);
            if host_path.is_dir() {
                self.preopens.push((host_path, guest.clone()));
            } else {
                error!(
                    host = %host,
                    guest = %guest,
                    "Error opening volume: host directory does not exist"
                );
            }
        }
        self
    }

    /// Build the WASI preview1 context for this invocation.
    ///
    /// # Errors
    ///
    /// Returns an error if a stdio handle cannot be duplicated or a preopen
    /// cannot be opened.
    pub fn build_wasi(&self) -> Result<WasiP1Ctx, RuntimeError> {
        let mut builder = WasiCtxBuilder::new();

        builder.args(&self.args);
        for (key, value) in self.env.vars() {
            builder.env(key, value);
        }

        builder
            .stdin(InputFile::new(self.stdin.reopen()?))
            .stdout(OutputFile::new(self.stdout.handle()?))
            .stderr(OutputFile::new(self.stderr.handle()?));

        for (host, guest) in &self.preopens {
            builder
                .preopened_dir(host, guest, DirPerms::all(), FilePerms::all())
                .map_err(|e| WasiError::FilesystemError {
                    operation: format!("preopen {} as {guest}: {e}", host.display()),
                })?;
        }

        Ok(builder.build_p1())
    }
}

/// Store data for one module instance.
///
/// Host functions reach this through [`wasmtime::Caller::data_mut`].
pub struct WorkerContext {
    /// WASI preview1 context.
    pub wasi: WasiP1Ctx,

    /// Outbound HTTP state, present only when the module may make requests.
    pub http: Option<HttpProxy>,

    /// Request identifier for tracing.
    pub request_id: String,
}

impl WorkerContext {
    /// Create a context.
    pub fn new(wasi: WasiP1Ctx, http: Option<HttpProxy>, request_id: impl Into<String>) -> Self {
        Self {
            wasi,
            http,
            request_id: request_id.into(),
        }
    }

    /// Outbound HTTP state, when granted.
    pub fn http_mut(&mut self) -> Option<&mut HttpProxy> {
        self.http.as_mut()
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("request_id", &self.request_id)
            .field("http", &self.http.is_some())
            .finish_non_exhaustive()
    }
}

/// Create a new Wasmtime store with the configured limits.
///
/// # Arguments
///
/// * `engine` - The shared Wasmtime engine
/// * `config` - Execution configuration (fuel, timeout)
/// * `context` - Store data for the instance
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    context: WorkerContext,
) -> Result<Store<WorkerContext>, RuntimeError> {
    let mut store = Store::new(engine.inner(), context);

    if engine.config().consume_fuel {
        store
            .set_fuel(config.max_fuel)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }

    if engine.config().epoch_interruption {
        // Deadline is relative to the current epoch.
        let ticks = if config.timeout().is_some() {
            config.deadline_ticks()
        } else {
            u64::MAX
        };
        store.set_epoch_deadline(ticks);
        debug!(deadline_ticks = ticks, "Epoch deadline set");
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<WorkerContext>) -> Option<u64> {
    store.get_fuel().ok()
}
