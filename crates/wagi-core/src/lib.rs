//! Core WebAssembly execution for wagi.
//!
//! This crate runs WAGI modules: WebAssembly programs that answer HTTP
//! requests the way CGI scripts do.
//! - [`WasmEngine`]: Configured Wasmtime engine shared by every request
//! - [`ModuleResolver`]: Compile-once module cache
//! - [`cgi`]: Request to environment/argv translation
//! - [`output`]: Guest stdout to response parsing
//! - [`InstanceRunner`]: Instance lifecycle management
//! - [`WagiHost`]: Per-request orchestration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared across all requests, thread-safe)              │
//! │  - Epoch interruption, optional fuel                    │
//! │  - Compilation settings                                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              ModuleResolver / CompiledModule            │
//! │  (Compiled once per path, cached forever)               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Store<WorkerContext> + Instance              │
//! │  (Per-request, isolated)                                │
//! │  - CGI environment and argv                             │
//! │  - stdin, stdout and stderr in temp files               │
//! │  - Outbound HTTP session when allowed                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cgi;
pub mod endpoint;
pub mod engine;
pub mod instance;
pub mod module;
pub mod output;
pub mod resolver;
pub mod store;
pub mod temp;
pub mod wagi;

pub use cgi::{CgiEnvironment, CgiRequest};
pub use endpoint::ModuleSpec;
pub use engine::{EpochTicker, WasmEngine};
pub use instance::InstanceRunner;
pub use module::CompiledModule;
pub use output::{ParsedResponse, ResponseBody};
pub use resolver::ModuleResolver;
pub use store::{ExecutionContext, WorkerContext};
pub use temp::TempResource;
pub use wagi::{SubRoute, WagiHost, WagiResponse};
