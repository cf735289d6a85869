//! Upstream transport

pub mod config;
pub mod upstream;

pub use config::UpstreamConfig;
pub use upstream::{join_uri, HttpUpstream};
