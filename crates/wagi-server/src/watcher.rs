//! Configuration reload.
//!
//! Watches the configuration file and rebuilds the route table when it
//! changes. Bursts of file events are debounced into one rebuild.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use wagi_common::{ConfigFile, ConfigFileError, WagiConfig};

use crate::state::AppState;

/// Capacity of the change notification queue.
const QUEUE_CAPACITY: usize = 128;

/// Default quiet period before a rebuild.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Where the module configuration is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A full configuration file; its `[wagi]` section is used.
    File(PathBuf),

    /// A legacy `modules.toml` file.
    ModulesToml(PathBuf),
}

impl ConfigSource {
    /// The watched file.
    pub fn path(&self) -> &Path {
        match self {
            Self::File(path) | Self::ModulesToml(path) => path,
        }
    }

    /// Read the module configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(&self) -> Result<WagiConfig, ConfigFileError> {
        match self {
            Self::File(path) => Ok(ConfigFile::from_file(path)?.wagi),
            Self::ModulesToml(path) => WagiConfig::from_modules_toml_file(path),
        }
    }
}

/// Errors that can occur while setting up the watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// The file system watcher could not be created.
    #[error("Failed to initialize watcher: {0}")]
    Init(#[from] notify::Error),

    /// The watched path has no file name.
    #[error("Cannot watch {path}: not a file path")]
    NotAFile {
        /// The offending path.
        path: String,
    },
}

/// Rebuilds the route table when the configuration file changes.
///
/// The parent directory is watched rather than the file, so editors that
/// replace the file on save are still seen. Dropping the watcher stops it.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `source`, rebuilding `state` after each quiet period.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the file system watcher cannot be started.
    pub fn spawn(
        state: AppState,
        source: ConfigSource,
        debounce: Duration,
    ) -> Result<Self, WatcherError> {
        let path = source.path();
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| WatcherError::NotAFile {
                path: path.display().to_string(),
            })?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let (tx, rx) = mpsc::channel::<()>(QUEUE_CAPACITY);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if is_change_to(&event, &file_name) => {
                    // A full queue already guarantees a pending rebuild.
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Configuration watch error"),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %source.path().display(), "Watching configuration for changes");

        let task = tokio::spawn(reload_loop(state, source, rx, debounce));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop watching.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Returns `true` if `event` modifies the file named `file_name`.
fn is_change_to(event: &Event, file_name: &OsString) -> bool {
    !event.kind.is_access()
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Wait for change notifications and rebuild once per burst.
async fn reload_loop(
    state: AppState,
    source: ConfigSource,
    mut rx: mpsc::Receiver<()>,
    debounce: Duration,
) {
    while rx.recv().await.is_some() {
        loop {
            tokio::time::sleep(debounce).await;
            let mut drained = 0_usize;
            while rx.try_recv().is_ok() {
                drained += 1;
            }
            if drained == 0 {
                break;
            }
            debug!(events = drained, "More configuration changes, waiting");
        }

        info!(path = %source.path().display(), "Configuration changed, rebuilding routes");
        match source.load() {
            Ok(config) => state.reload(config).await,
            Err(e) => error!(error = %e, "Failed to load configuration, keeping current routes"),
        }
    }

    debug!("Configuration watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;
    use notify::event::{AccessKind, ModifyKind};
    use wagi_common::RuntimeConfig;

    const MODULE_WAT: &str = r#"(module (func (export "_start")))"#;

    fn modules_toml(route: &str) -> String {
        format!("[[module]]\nroute = \"{route}\"\nmodule = \"hello.wat\"\n")
    }

    #[test]
    fn test_load_modules_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.toml");
        std::fs::write(&path, modules_toml("/hello")).unwrap();

        let config = ConfigSource::ModulesToml(path).load().unwrap();
        assert_eq!(config.modules["hello"].route, "/hello");
        assert_eq!(config.module_path.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagi.toml");
        std::fs::write(
            &path,
            "[wagi.modules.hello]\nroute = \"/hello\"\nmodule = \"hello.wasm\"\n",
        )
        .unwrap();

        let config = ConfigSource::File(path).load().unwrap();
        assert_eq!(config.modules["hello"].filename, "hello.wasm");
    }

    #[test]
    fn test_load_missing_file() {
        let source = ConfigSource::File(PathBuf::from("/nonexistent/wagi.toml"));
        assert!(matches!(source.load(), Err(ConfigFileError::Io { .. })));
    }

    #[test]
    fn test_is_change_to() {
        let name = OsString::from("modules.toml");
        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/wagi/modules.toml"));
        let other = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/wagi/other.toml"));
        let access = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/etc/wagi/modules.toml"));

        assert!(is_change_to(&modify, &name));
        assert!(!is_change_to(&other, &name));
        assert!(!is_change_to(&access, &name));
    }

    #[tokio::test]
    async fn test_reload_loop_collapses_burst() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.wat"), MODULE_WAT).unwrap();
        let path = dir.path().join("modules.toml");
        std::fs::write(&path, modules_toml("/first")).unwrap();

        let state =
            AppState::new(&RuntimeConfig::default(), &WagiConfig::default(), 1024).unwrap();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(reload_loop(
            state.clone(),
            ConfigSource::ModulesToml(path.clone()),
            rx,
            Duration::from_millis(20),
        ));

        tx.send(()).await.unwrap();
        std::fs::write(&path, modules_toml("/second")).unwrap();
        tx.send(()).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(state.generation(), 1);
        let routes = state.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes.entries()[0].pattern(), "/second");
    }

    #[tokio::test]
    async fn test_watcher_rebuilds_on_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.wat"), MODULE_WAT).unwrap();
        let path = dir.path().join("modules.toml");
        std::fs::write(&path, modules_toml("/hello")).unwrap();

        let state =
            AppState::new(&RuntimeConfig::default(), &WagiConfig::default(), 1024).unwrap();
        let watcher = ConfigWatcher::spawn(
            state.clone(),
            ConfigSource::ModulesToml(path.clone()),
            Duration::from_millis(50),
        )
        .unwrap();

        std::fs::write(&path, modules_toml("/changed")).unwrap();

        let mut published = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let routes = state.routes();
            if routes.entries().first().map(|e| e.pattern()) == Some("/changed") {
                published = true;
                break;
            }
        }
        watcher.shutdown();
        assert!(published);
    }
}
