//! Registry configuration

use crate::request::DEFAULT_COMPONENT;

/// Session registry configuration options
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Component name for requests that do not identify their client
    pub default_component: String,

    /// Query string appended to the canonical resource path for upstream watches
    pub watch_query: String,

    /// Remove a session from the registry once it has terminated and lost its
    /// last subscriber. When disabled, terminated sessions stay registered for
    /// the process lifetime.
    pub reap_terminated: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_component: DEFAULT_COMPONENT.to_string(),
            watch_query: "watch=true".to_string(),
            reap_terminated: true,
        }
    }
}

impl RegistryConfig {
    /// Set the fallback component name
    pub fn default_component(mut self, component: impl Into<String>) -> Self {
        self.default_component = component.into();
        self
    }

    /// Set the streaming-mode query string
    pub fn watch_query(mut self, query: impl Into<String>) -> Self {
        self.watch_query = query.into();
        self
    }

    /// Keep terminated sessions registered
    pub fn keep_terminated(mut self) -> Self {
        self.reap_terminated = false;
        self
    }
}
