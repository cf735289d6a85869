//! Watch-multiplexing reverse proxy
//!
//! Many local clients watching the same resource share a single upstream
//! watch stream. The first watch (or read) of a resource opens one upstream
//! connection; every later watcher attaches to it and receives the same bytes
//! in the same order.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use watch_mux::transport::{HttpUpstream, UpstreamConfig};
//! use watch_mux::registry::StorageKeyFunc;
//! use watch_mux::{ProxyServer, ServerConfig, SiteProxy};
//!
//! # async fn run() -> watch_mux::Result<()> {
//! let upstream = Arc::new(HttpUpstream::new(UpstreamConfig::with_servers([
//!     "http://10.0.0.1:6443".parse().unwrap(),
//! ]))?);
//! let proxy = SiteProxy::new(Arc::new(StorageKeyFunc), upstream.clone(), upstream);
//! let server = ProxyServer::new(ServerConfig::default(), proxy);
//! server.run().await
//! # }
//! ```

pub mod error;
pub mod proxy;
pub mod registry;
pub mod request;
pub mod server;
pub mod session;
pub mod sink;
pub mod stats;
pub mod status;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use proxy::{Handler, SiteProxy};
pub use registry::{RegistryConfig, SessionRegistry};
pub use server::{ProxyServer, ServerConfig};
pub use status::ApiStatus;
