//! Session registry implementation
//!
//! Maps resource keys to watch sessions and guarantees that concurrent
//! requests for the same key share one session, and therefore one upstream
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::config::RegistryConfig;
use super::key::{KeyBuildInfo, KeyFunc, ResourceKey};
use crate::error::{KeyError, Result};
use crate::proxy::Handler;
use crate::request::{cancellation, client_component, request_info, ProxyRequest, RequestInfo};
use crate::session::WatchSession;
use crate::sink::ResponseSink;
use crate::stats::SessionStats;

/// Central registry for all watch sessions
///
/// Lookups take the read half of the lock; creation takes the write half and
/// checks again before constructing, so two racing creators can never both
/// build a session for the same key.
pub struct SessionRegistry {
    /// Map of resource key to live session
    sessions: RwLock<HashMap<ResourceKey, Arc<WatchSession>>>,

    key_func: Arc<dyn KeyFunc>,

    /// Upstream that session round trips go through
    upstream: Arc<dyn Handler>,

    /// Parent of every session's top-level token
    shutdown: CancellationToken,

    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a registry with default configuration
    pub fn new(key_func: Arc<dyn KeyFunc>, upstream: Arc<dyn Handler>) -> Self {
        Self::with_config(key_func, upstream, RegistryConfig::default())
    }

    /// Create a registry with custom configuration
    pub fn with_config(
        key_func: Arc<dyn KeyFunc>,
        upstream: Arc<dyn Handler>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            key_func,
            upstream,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn component<'a>(&'a self, req: &'a ProxyRequest) -> &'a str {
        client_component(req).unwrap_or(&self.config.default_component)
    }

    /// Compute the resource key of a request
    pub fn compute_key(&self, req: &ProxyRequest) -> Result<ResourceKey> {
        let info = request_info(req).ok_or(KeyError::MissingRequestInfo)?;

        let build = KeyBuildInfo {
            component: self.component(req).to_string(),
            group: info.api_group.clone(),
            version: info.api_version.clone(),
            resources: info.resource.clone(),
            namespace: info.namespace.clone(),
            name: info.name.clone(),
        };
        Ok(self.key_func.key(&build)?)
    }

    /// Compute the request's key and report whether a session serves it
    pub async fn is_watching(&self, req: &ProxyRequest) -> Result<(ResourceKey, bool)> {
        let key = self.compute_key(req)?;
        let exists = self.exists(&key).await;
        Ok((key, exists))
    }

    /// Whether a usable session is registered for `key`
    ///
    /// When terminated sessions are reaped, a terminated session that has not
    /// been removed yet already counts as absent.
    pub async fn exists(&self, key: &ResourceKey) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(key)
            .is_some_and(|session| self.is_usable(session))
    }

    fn is_usable(&self, session: &WatchSession) -> bool {
        !self.config.reap_terminated || !session.is_terminated()
    }

    /// Find or create the session for a request, optionally subscribing to it
    ///
    /// Without a sink the call only primes the session (so it starts
    /// populating the cache) and returns at once. With a sink it blocks until
    /// the request's cancellation token fires or the session terminates.
    pub async fn attach_or_create(
        self: &Arc<Self>,
        req: &ProxyRequest,
        sink: Option<Arc<dyn ResponseSink>>,
    ) -> Result<()> {
        let info = request_info(req).ok_or(KeyError::MissingRequestInfo)?;
        let key = self.compute_key(req)?;
        let session = self.get_or_create(&key, info, self.component(req)).await?;

        let Some(sink) = sink else {
            return Ok(());
        };

        let result = session.attach(sink, cancellation(req)).await;
        self.reap(&session).await;
        result
    }

    async fn get_or_create(
        self: &Arc<Self>,
        key: &ResourceKey,
        info: &RequestInfo,
        component: &str,
    ) -> Result<Arc<WatchSession>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(key).filter(|s| self.is_usable(s)) {
                return Ok(Arc::clone(session));
            }
        }

        let mut sessions = self.sessions.write().await;

        // Another caller may have created it while we waited for the write lock
        if let Some(session) = sessions.get(key).filter(|s| self.is_usable(s)) {
            return Ok(Arc::clone(session));
        }

        // Build before registering: a request that cannot be built leaves no entry
        let session = Arc::new(WatchSession::new(
            key.clone(),
            info.clone(),
            component,
            &self.config.watch_query,
            Arc::clone(&self.upstream),
            self.shutdown.child_token(),
        )?);

        self.spawn_session(Arc::clone(&session));
        let replaced = sessions.insert(key.clone(), Arc::clone(&session)).is_some();

        tracing::info!(
            key = %key,
            component = component,
            replaced = replaced,
            sessions = sessions.len(),
            "Watch session created"
        );

        Ok(session)
    }

    fn spawn_session(self: &Arc<Self>, session: Arc<WatchSession>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            Arc::clone(&session).run().await;
            registry.reap(&session).await;
        });
    }

    /// Remove a session once it has terminated and has no subscribers left
    async fn reap(&self, session: &Arc<WatchSession>) {
        if !self.config.reap_terminated
            || !session.is_terminated()
            || session.subscriber_count() > 0
        {
            return;
        }

        let mut sessions = self.sessions.write().await;
        let registered = sessions
            .get(session.key())
            .is_some_and(|current| Arc::ptr_eq(current, session));

        if registered && session.subscriber_count() == 0 {
            sessions.remove(session.key());
            tracing::debug!(key = %session.key(), sessions = sessions.len(), "Watch session removed");
        }
    }

    /// Get the session registered for `key`
    pub async fn session(&self, key: &ResourceKey) -> Option<Arc<WatchSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Get session statistics
    pub async fn session_stats(&self, key: &ResourceKey) -> Option<SessionStats> {
        self.session(key).await.map(|session| session.stats())
    }

    /// Get total number of registered sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop every session; subscribers are released with an error
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions = self.sessions.read().await;
        tracing::info!(sessions = sessions.len(), "Shutting down watch sessions");
    }
}
