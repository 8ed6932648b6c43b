//! quay-server - multi-tenant development/preview server.
//!
//! Serves one or more client applications from the filesystem, forwards
//! selected path prefixes to upstream services, renders server-side content
//! on demand, and pushes live-reload and shared-state notifications to
//! connected browsers over WebSocket.
//!
//! # Architecture
//!
//! - [`config`] - mounts, proxy rules, frozen per-mount configuration
//! - [`dispatch`] - per-request composition: remap, mount, proxy, API,
//!   static/SSR, in that order
//! - [`router`] - linear-scan API router with an explicit middleware chain
//! - [`resolver`] - security-hardened static file resolution
//! - [`proxy`] - streaming reverse-proxy forwarder
//! - [`ssr`] - server-side render hook and HTML pipeline
//! - [`hub`] / [`state`] - WebSocket broadcast hub and keyed shared state
//! - [`watcher`] - debounced filesystem change stream
//! - [`server`] - axum assembly, bind and graceful shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use quay_server::config::{ClientMount, ServerConfig};
//! use quay_server::server::DevServer;
//!
//! # async fn run() -> quay_server::error::Result<()> {
//! let config = ServerConfig::new("127.0.0.1:3000".parse().unwrap())
//!     .mount(ClientMount::new("./site"));
//!
//! let handle = DevServer::new(config)?.serve().await?;
//! # handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod html;
pub mod hub;
pub mod importmap;
pub mod middleware;
pub mod mime;
pub mod protocol;
pub mod proxy;
pub mod resolver;
pub mod router;
pub mod server;
pub mod ssr;
pub mod state;
pub mod transform;
pub mod watcher;

// Re-export commonly used types
pub use config::{ClientMount, ProxyRule, ServerConfig};
pub use error::{HttpError, Result, ResultExt, ServerError};
pub use hub::HmrHub;
pub use protocol::HmrMessage;
pub use router::{ApiRequest, ApiResponse, RouteMethod, Router};
pub use server::{DevServer, ServerHandle};
