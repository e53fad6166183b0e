//! Configuration file structures for wagi.
//!
//! This module defines the layout of the main configuration file:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//!
//! The module schema itself lives in [`crate::modules`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;
use crate::modules::WagiConfig;

/// Top-level configuration file structure.
///
/// Files ending in `.json` are parsed as JSON, everything else as TOML.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// epoch_interruption = true
///
/// [runtime.execution]
/// timeout_ms = 30000
///
/// [server]
/// bind_addr = "0.0.0.0:3000"
///
/// [wagi]
/// module_path = "modules"
///
/// [wagi.modules.fibonacci]
/// route = "/fibonacci"
/// filename = "fibonacci.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine + execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Module and bindle definitions.
    #[serde(default)]
    pub wagi: WagiConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ConfigFileError> {
        serde_json::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,

    /// Largest request body accepted, in bytes.
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,

    /// Rebuild the route table when the configuration file changes.
    #[serde(default = "defaults::watch_config")]
    pub watch_config: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
            max_body_bytes: defaults::max_body_bytes(),
            watch_config: defaults::watch_config(),
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        60
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub const fn max_body_bytes() -> usize {
        16 * 1024 * 1024
    }

    pub const fn watch_config() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.server.request_timeout_secs, 60);
        assert!(config.server.graceful_shutdown);
        assert!(config.server.watch_config);
        assert!(config.wagi.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:8080"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        // Defaults applied
        assert_eq!(config.server.request_timeout_secs, 60);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            consume_fuel = true

            [runtime.execution]
            max_fuel = 5_000_000
            timeout_ms = 50

            [server]
            bind_addr = "0.0.0.0:9000"
            graceful_shutdown = false

            [wagi]
            module_path = "./wasm"
            max_http_requests = 20
            bindle_server = "http://localhost:8080/v1"

            [wagi.modules.fibonacci]
            route = "/fibonacci"
            filename = "fibonacci.wasm"

            [wagi.modules.proxy]
            route = "/proxy/..."
            filename = "proxy.wasm"
            allowed_hosts = ["https://api.example.com"]

            [wagi.bindles.app]
            name = "example.com/app/1.0.0"
            route = "/app"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(config.runtime.engine.consume_fuel);
        assert_eq!(config.runtime.execution.max_fuel, 5_000_000);
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert!(!config.server.graceful_shutdown);
        assert_eq!(config.wagi.max_http_requests, Some(20));
        assert_eq!(config.wagi.modules.len(), 2);
        assert_eq!(config.wagi.modules["proxy"].allowed_hosts.len(), 1);
        assert_eq!(config.wagi.bindles["app"].name, "example.com/app/1.0.0");
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagi.json");
        std::fs::write(
            &path,
            r#"{"wagi": {"modules": {"hello": {"route": "/hello", "filename": "hello.wat"}}}}"#,
        )
        .unwrap();

        let config = ConfigFile::from_file(&path).unwrap();
        assert_eq!(config.wagi.modules["hello"].route, "/hello");
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/no/such/wagi.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
