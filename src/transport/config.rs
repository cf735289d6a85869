//! Upstream configuration

use std::time::Duration;

use http::Uri;

/// Upstream load balancer options
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URIs of the upstream API servers, tried round-robin
    pub servers: Vec<Uri>,

    /// How long an idle pooled connection is kept
    pub pool_idle_timeout: Duration,

    /// Maximum idle connections kept per upstream host
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

impl UpstreamConfig {
    /// Create a config for the given servers
    pub fn with_servers(servers: impl IntoIterator<Item = Uri>) -> Self {
        Self {
            servers: servers.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Add an upstream server
    pub fn server(mut self, uri: Uri) -> Self {
        self.servers.push(uri);
        self
    }

    /// Set the pooled connection idle timeout
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    /// Set the idle connection cap per host
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }
}
