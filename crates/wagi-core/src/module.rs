//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's
//! [`Module`] that remembers where it came from and answers the export/import
//! questions the WAGI host asks before instantiating.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module};

use wagi_common::RuntimeError;
use wagi_common::modules::has_module_extension;

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is thread-safe and can be shared across instances and
/// requests. The underlying Wasmtime module is reference counted.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Where the module was loaded from.
    path: PathBuf,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a module from a `.wasm` or `.wat` file.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleLoad`] if the file is missing, has the
    /// wrong extension, or fails to parse or validate.
    #[instrument(skip(engine, path), fields(path = %path.as_ref().display()))]
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let start = Instant::now();

        let has_extension = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(has_module_extension);
        if !has_extension {
            return Err(RuntimeError::module_load(
                path.display().to_string(),
                "only .wasm and .wat modules are supported",
            ));
        }

        if !path.is_file() {
            return Err(RuntimeError::module_load(
                path.display().to_string(),
                "file not found",
            ));
        }

        let module = Module::from_file(engine, path).map_err(|e| {
            RuntimeError::module_load(path.display().to_string(), format!("{e:#}"))
        })?;

        info!(
            path = %path.display(),
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self {
            inner: module,
            path: path.to_path_buf(),
            compiled_at: Instant::now(),
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let module = Module::new(engine, wat)
            .map_err(|e| RuntimeError::module_load("<wat>", format!("{e:#}")))?;

        Ok(Self {
            inner: module,
            path: PathBuf::from("<wat>"),
            compiled_at: Instant::now(),
        })
    }

    /// Get the inner Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.inner
    }

    /// Where the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Returns `true` if `name` is exported as a function.
    pub fn exports_function(&self, name: &str) -> bool {
        matches!(self.inner.get_export(name), Some(ExternType::Func(_)))
    }

    /// Returns `true` if any import comes from the given module namespace.
    pub fn imports_module(&self, module: &str) -> bool {
        self.inner.imports().any(|import| import.module() == module)
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
