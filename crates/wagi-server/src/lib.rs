//! HTTP Server for wagi.
//!
//! This crate serves WAGI modules over HTTP. It handles:
//!
//! - Route table construction from modules, sub-routes and bindles
//! - Request dispatch by method, path and host
//! - Streaming guest output back to the client
//! - Rebuilding routes when the configuration changes
//!
//! # Quick Start
//!
//! ```ignore
//! use wagi_server::{ServerConfig, WagiServer};
//! use wagi_common::{RuntimeConfig, WagiConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let wagi = WagiConfig::from_modules_toml_file("modules.toml")?;
//!     let server = WagiServer::new(&RuntimeConfig::default(), &wagi, ServerConfig::default())?;
//!
//!     server.state().rebuild(wagi).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod bindle;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod routes;
pub mod server;
pub mod state;
pub mod watcher;

pub use bindle::{BindleResolver, FileBindleSource, HttpBindleSource, ParcelResolver};
pub use routes::{RouteEntry, RouteMatch, RouteTable};
pub use server::{ServerConfig, TestHandle, WagiServer};
pub use state::AppState;
pub use watcher::{ConfigSource, ConfigWatcher};
