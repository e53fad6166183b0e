//! Compiled module cache.
//!
//! [`ModuleResolver`] owns the shared [`WasmEngine`] and compiles each module
//! file at most once for the life of the process. Concurrent first requests
//! for the same path wait on a per-path cell rather than a global lock, so
//! unrelated modules compile in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::{debug, instrument};

use wagi_common::RuntimeError;

use crate::{CompiledModule, WasmEngine};

type ModuleCell = Arc<OnceCell<Arc<CompiledModule>>>;

/// Loads and caches compiled modules keyed by file path.
///
/// Entries are never invalidated: replacing a module file on disk has no
/// effect until the process restarts.
#[derive(Debug)]
pub struct ModuleResolver {
    engine: WasmEngine,
    modules: DashMap<PathBuf, ModuleCell>,
}

impl ModuleResolver {
    /// Create a resolver around an engine.
    pub fn new(engine: WasmEngine) -> Self {
        Self {
            engine,
            modules: DashMap::new(),
        }
    }

    /// The shared engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Get a compiled module, compiling it on first use.
    ///
    /// This blocks while compiling; call it from a blocking worker.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleLoad`] if the file is missing, has an
    /// unsupported extension, or does not compile. Failures are not cached.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn get_module(&self, path: impl AsRef<Path>) -> Result<Arc<CompiledModule>, RuntimeError> {
        let path = path.as_ref();

        // Clone the cell out so the map shard is not locked while compiling.
        let cell = self
            .modules
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(module) = cell.get() {
            debug!("Module cache hit");
            return Ok(Arc::clone(module));
        }

        cell.get_or_try_init(|| CompiledModule::from_file(self.engine.inner(), path).map(Arc::new))
            .map(Arc::clone)
    }

    /// Number of paths seen, including any whose compilation failed.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if no module has been requested.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Returns `true` if the module at `path` has been compiled.
    pub fn is_cached(&self, path: impl AsRef<Path>) -> bool {
        self.modules
            .get(path.as_ref())
            .is_some_and(|cell| cell.get().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wagi_common::EngineConfig;

    fn resolver() -> ModuleResolver {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        ModuleResolver::new(engine)
    }

    #[test]
    fn test_caches_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.wat");
        std::fs::write(&path, "(module (func (export \"_start\")))").unwrap();

        let resolver = resolver();
        assert!(!resolver.is_cached(&path));

        let first = resolver.get_module(&path).unwrap();
        let second = resolver.get_module(&path).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(resolver.is_cached(&path));
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_failure_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.wat");

        let resolver = resolver();
        assert!(resolver.get_module(&path).is_err());

        std::fs::write(&path, "(module)").unwrap();
        assert!(resolver.get_module(&path).is_ok());
    }

    #[test]
    fn test_rejects_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.bin");
        std::fs::write(&path, "(module)").unwrap();

        let err = resolver().get_module(&path).unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleLoad { .. }));
    }
}
