//! Common types, errors, and configuration for wagi.
//!
//! This crate provides shared functionality used across the wagi workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Runtime configuration for the execution engine
//! - The module/bindle configuration schema and its validation

pub mod config;
pub mod config_file;
pub mod error;
pub mod modules;

pub use config::{EngineConfig, ExecutionConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{ConfigError, RuntimeError, WasiError};
pub use modules::{BindleInfo, ModuleInfo, WagiConfig};
