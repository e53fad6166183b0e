//! Error types for wagi.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors raised while resolving or executing a module
//! - [`WasiError`]: WASI context construction errors
//! - [`ConfigError`]: Accumulated configuration violations

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur while serving one request,
/// from module resolution through guest execution to parsing the guest's output.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The module file could not be loaded, compiled, or validated.
    #[error("Failed to load module {path}: {reason}")]
    ModuleLoad {
        /// Path of the module file.
        path: String,
        /// Description of the failure.
        reason: String,
    },

    /// The configured entrypoint is not an exported function of the module.
    #[error("Function {entrypoint} is not exported by {module}")]
    EntrypointNotFound {
        /// The entrypoint that was requested.
        entrypoint: String,
        /// The module that was searched.
        module: String,
    },

    /// The module imports `wasi_experimental_http` but no allowed hosts are configured.
    #[error("Allowed hosts must be configured for modules making HTTP requests: {module}")]
    AllowedHostsRequired {
        /// The module that made the import.
        module: String,
    },

    /// The guest wrote no `content-type`, `location` or `status` header.
    #[error("Module did not produce a location, content-type or status header")]
    InsufficientResponse,

    /// A header line in the guest output exceeded the parser buffer.
    #[error("Response header too long (limit {limit} bytes)")]
    HeaderTooLong {
        /// The maximum header line length in bytes.
        limit: usize,
    },

    /// The guest header block could not be interpreted.
    #[error("Malformed response header: {reason}")]
    MalformedResponse {
        /// Description of the problem.
        reason: String,
    },

    /// Execution exceeded the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The guest called `proc_exit` with a non-zero status.
    #[error("Module exited with status {code}")]
    GuestExit {
        /// The exit status.
        code: i32,
    },

    /// WASI operation failed.
    #[error("WASI error: {0}")]
    Wasi(#[from] WasiError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// One or more configuration violations were found.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// WASI-related errors.
///
/// These errors occur while building the sandbox a module runs in.
#[derive(Error, Debug)]
pub enum WasiError {
    /// Failed to initialize WASI context.
    #[error("WASI initialization failed: {reason}")]
    InitializationFailed {
        /// Description of the initialization failure.
        reason: String,
    },

    /// A preopened directory could not be mapped.
    #[error("WASI filesystem error: {operation}")]
    FilesystemError {
        /// The filesystem operation that failed.
        operation: String,
    },

    /// WASI environment configuration error.
    #[error("WASI environment error: {reason}")]
    EnvironmentError {
        /// Description of the environment error.
        reason: String,
    },
}

/// A configuration report holding every violation found during validation.
///
/// Validation never stops at the first problem; the whole configuration is
/// checked and all violations are reported together.
#[derive(Error, Debug, Default, Clone, PartialEq, Eq)]
#[error("Invalid configuration:\n{}", .violations.join("\n"))]
pub struct ConfigError {
    violations: Vec<String>,
}

impl ConfigError {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one violation.
    pub fn push(&mut self, violation: impl Into<String>) {
        self.violations.push(violation.into());
    }

    /// Returns `true` if no violations were recorded.
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// The recorded violations, in discovery order.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Convert the report into a `Result`, failing if anything was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl RuntimeError {
    /// Create a new `ModuleLoad` error.
    pub fn module_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModuleLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `EntrypointNotFound` error.
    pub fn entrypoint_not_found(entrypoint: impl Into<String>, module: impl Into<String>) -> Self {
        Self::EntrypointNotFound {
            entrypoint: entrypoint.into(),
            module: module.into(),
        }
    }

    /// Create a new `MalformedResponse` error.
    pub fn malformed_response(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the guest broke the response protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::InsufficientResponse | Self::HeaderTooLong { .. } | Self::MalformedResponse { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::ExecutionTimeout { .. })
    }

    /// Returns `true` if this error comes from configuration rather than execution.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::Config(_) | Self::AllowedHostsRequired { .. }
        )
    }
}
