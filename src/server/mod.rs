//! HTTP front end

pub mod config;
pub mod listener;

pub use config::ServerConfig;
pub use listener::{component_from_user_agent, ProxyBody, ProxyServer};
