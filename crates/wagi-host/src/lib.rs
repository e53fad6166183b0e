//! Host functions implementation for wagi.
//!
//! This crate provides the `wasi_experimental_http` import module: the host
//! side of the ABI that lets guest modules make outbound HTTP requests.
//!
//! # Modules
//!
//! - [`http_outbound`]: Per-instance proxy state and error codes
//! - [`linker`]: Registration of the host functions on a Wasmtime linker
//! - [`permissions`]: Allow-list and concurrency configuration
//!
//! # Security Model
//!
//! 1. **Allow-list**: A guest may only reach hosts that were explicitly
//!    granted to its module; everything else fails with
//!    [`ProxyError::DestinationNotAllowed`].
//! 2. **Session cap**: Each instance may hold a bounded number of open
//!    responses at once.
//! 3. **Isolation**: Each instance owns its own [`HttpProxy`]; handles never
//!    cross instances.

pub mod http_outbound;
pub mod linker;
pub mod permissions;

pub use http_outbound::{HttpProxy, ProxyError};
pub use linker::{MODULE_NAME, add_to_linker};
pub use permissions::Permissions;
