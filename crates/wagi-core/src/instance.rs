//! WebAssembly instance lifecycle management.
//!
//! This module provides [`InstanceRunner`], which handles the complete lifecycle
//! of one guest invocation:
//!
//! 1. Check the entrypoint and imports against the module's tables
//! 2. Instantiate the module with a fresh store
//! 3. Call the entrypoint synchronously
//! 4. Map exits and traps onto [`RuntimeError`]

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use wasmtime::{Linker, Trap};

use wagi_common::{ExecutionConfig, RuntimeError};
use wagi_host::MODULE_NAME as HTTP_MODULE;

use crate::store::{WorkerContext, create_store};
use crate::{CompiledModule, WasmEngine};

/// Instance lifecycle manager.
///
/// Holds two linkers: one with WASI preview1 only, and one that also defines
/// the outbound HTTP functions. A module is linked against the second only
/// when its store carries an [`wagi_host::HttpProxy`].
///
/// # Thread Safety
///
/// `InstanceRunner` is thread-safe and shared across requests. Each invocation
/// uses its own store.
#[derive(Clone)]
pub struct InstanceRunner {
    engine: WasmEngine,
    linker: Linker<WorkerContext>,
    http_linker: Linker<WorkerContext>,
    config: ExecutionConfig,
}

impl InstanceRunner {
    /// Create a new instance runner.
    ///
    /// # Errors
    ///
    /// Returns an error if host function registration fails.
    pub fn new(engine: WasmEngine, config: ExecutionConfig) -> Result<Self, RuntimeError> {
        let mut linker = Linker::new(engine.inner());
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |ctx: &mut WorkerContext| {
            &mut ctx.wasi
        })
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to add WASI to linker: {e}")))?;

        let mut http_linker = linker.clone();
        wagi_host::add_to_linker(&mut http_linker, WorkerContext::http_mut).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register outbound HTTP functions: {e}"))
        })?;

        Ok(Self {
            engine,
            linker,
            http_linker,
            config,
        })
    }

    /// The shared engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Per-invocation limits.
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run `entrypoint` of `module` to completion.
    ///
    /// Blocks the calling thread. Returns the wall-clock duration of the call.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::EntrypointNotFound`] if the entrypoint is not an
    ///   exported function
    /// - [`RuntimeError::AllowedHostsRequired`] if the module imports outbound
    ///   HTTP but the context has no proxy
    /// - [`RuntimeError::FuelExhausted`], [`RuntimeError::ExecutionTimeout`],
    ///   [`RuntimeError::GuestExit`] or [`RuntimeError::Trap`] from execution
    #[instrument(
        skip(self, module, context),
        fields(module = %module.path().display(), request_id = %context.request_id)
    )]
    pub fn run(
        &self,
        module: &CompiledModule,
        entrypoint: &str,
        context: WorkerContext,
    ) -> Result<Duration, RuntimeError> {
        if !module.exports_function(entrypoint) {
            return Err(RuntimeError::entrypoint_not_found(
                entrypoint,
                module.path().display().to_string(),
            ));
        }

        let has_http = context.http.is_some();
        if module.imports_module(HTTP_MODULE) && !has_http {
            return Err(RuntimeError::AllowedHostsRequired {
                module: module.path().display().to_string(),
            });
        }

        let linker = if has_http {
            &self.http_linker
        } else {
            &self.linker
        };
        let mut store = create_store(&self.engine, &self.config, context)?;
        let start = Instant::now();

        debug!("Instantiating module");

        let instance = linker
            .instantiate(&mut store, module.module())
            .map_err(|e| self.classify(e, start.elapsed()))?;

        let func = instance
            .get_typed_func::<(), ()>(&mut store, entrypoint)
            .map_err(|e| {
                warn!(error = %e, "Entrypoint has an unexpected signature");
                RuntimeError::entrypoint_not_found(entrypoint, module.path().display().to_string())
            })?;

        let result = func.call(&mut store, ());
        let duration = start.elapsed();

        match result.map_err(|e| self.classify(e, duration)) {
            Ok(()) | Err(RuntimeError::GuestExit { code: 0 }) => {
                info!(
                    entrypoint = entrypoint,
                    duration_ms = duration.as_millis(),
                    "Module execution completed"
                );
                Ok(duration)
            }
            Err(e) => {
                warn!(
                    entrypoint = entrypoint,
                    duration_ms = duration.as_millis(),
                    error = %e,
                    "Module execution failed"
                );
                Err(e)
            }
        }
    }

    /// Map an execution error onto a [`RuntimeError`].
    fn classify(&self, error: wasmtime::Error, elapsed: Duration) -> RuntimeError {
        if let Some(exit) = error.downcast_ref::<wasmtime_wasi::I32Exit>() {
            return RuntimeError::GuestExit { code: exit.0 };
        }

        match error.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => RuntimeError::FuelExhausted,
            Some(Trap::Interrupt) => RuntimeError::ExecutionTimeout {
                duration_ms: self
                    .config
                    .timeout()
                    .unwrap_or(elapsed)
                    .as_millis()
                    .try_into()
                    .unwrap_or(u64::MAX),
            },
            _ => RuntimeError::trap(format!("{error:#}")),
        }
    }
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wagi_common::EngineConfig;
    use wasmtime_wasi::WasiCtxBuilder;

    fn runner() -> InstanceRunner {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        InstanceRunner::new(engine, ExecutionConfig::default()).unwrap()
    }

    fn context() -> WorkerContext {
        WorkerContext::new(WasiCtxBuilder::new().build_p1(), None, "test")
    }

    #[test]
    fn test_run_success() {
        let runner = runner();
        let module =
            CompiledModule::from_wat(runner.engine().inner(), r#"(module (func (export "_start")))"#)
                .unwrap();

        assert!(runner.run(&module, "_start", context()).is_ok());
    }

    #[test]
    fn test_missing_entrypoint() {
        let runner = runner();
        let module = CompiledModule::from_wat(
            runner.engine().inner(),
            r#"(module (memory (export "other") 1) (func (export "_start")))"#,
        )
        .unwrap();

        let err = runner.run(&module, "main", context()).unwrap_err();
        assert!(matches!(err, RuntimeError::EntrypointNotFound { .. }));

        // Exported, but not a function
        let err = runner.run(&module, "other", context()).unwrap_err();
        assert!(matches!(err, RuntimeError::EntrypointNotFound { .. }));
    }

    #[test]
    fn test_http_import_requires_allowed_hosts() {
        let runner = runner();
        let module = CompiledModule::from_wat(
            runner.engine().inner(),
            r#"
            (module
                (import "wasi_experimental_http" "close" (func (param i32) (result i32)))
                (func (export "_start")))
            "#,
        )
        .unwrap();

        let err = runner.run(&module, "_start", context()).unwrap_err();
        assert!(matches!(err, RuntimeError::AllowedHostsRequired { .. }));
    }

    #[test]
    fn test_trap() {
        let runner = runner();
        let module = CompiledModule::from_wat(
            runner.engine().inner(),
            r#"(module (func (export "_start") unreachable))"#,
        )
        .unwrap();

        let err = runner.run(&module, "_start", context()).unwrap_err();
        assert!(matches!(err, RuntimeError::Trap { .. }));
    }
}
