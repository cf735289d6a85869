//! Server configuration

use std::net::SocketAddr;

/// Default listen port for the proxy
pub const DEFAULT_PORT: u16 = 10261;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Largest request body accepted, in bytes
    pub max_body_size: usize,

    /// Response chunks buffered per client before writers wait
    pub response_buffer: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 0, // Unlimited
            max_body_size: 3 * 1024 * 1024, // 3MB
            response_buffer: 16,
            tcp_nodelay: true, // Watch events are small and latency-sensitive
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the request body limit
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set the per-client response buffer, at least one chunk
    pub fn response_buffer(mut self, chunks: usize) -> Self {
        self.response_buffer = chunks.max(1);
        self
    }

    /// Disable TCP_NODELAY
    pub fn disable_nodelay(mut self) -> Self {
        self.tcp_nodelay = false;
        self
    }
}
