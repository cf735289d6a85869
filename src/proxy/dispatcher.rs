//! Request dispatcher
//!
//! Classifies every inbound resource request by verb and routes it:
//!
//! ```text
//!                    request + RequestInfo
//!                            │
//!        ┌───────────────────┼─────────────────────────────┐
//!        │                   │                             │
//!     watch        create/update/patch/delete     get/list/other reads
//!        │                   │                             │
//!  attach_or_create    upstream pass-through      session for key?
//!  (stream until           │                   ┌─────────┴──────────┐
//!   client leaves)         ▼                  yes                   no
//!                                              │                     │
//!                                         local cache      prime session +
//!                                                          upstream pass-through
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use super::handler::Handler;
use crate::error::{Error, Result};
use crate::registry::{KeyFunc, RegistryConfig, SessionRegistry};
use crate::request::{req_string, request_info, ProxyRequest, Verb};
use crate::sink::{write_error, ResponseSink};
use crate::stats::{DispatchSnapshot, DispatchStats};

/// Watch-multiplexing proxy for resource requests
pub struct SiteProxy {
    /// Serves reads from the local cache
    local_proxy: Arc<dyn Handler>,
    /// Upstream load balancer
    lb: Arc<dyn Handler>,
    registry: Arc<SessionRegistry>,
    stats: DispatchStats,
}

impl SiteProxy {
    /// Create a proxy whose sessions watch through `lb`
    pub fn new(
        key_func: Arc<dyn KeyFunc>,
        local_proxy: Arc<dyn Handler>,
        lb: Arc<dyn Handler>,
    ) -> Self {
        Self::with_config(key_func, local_proxy, lb, RegistryConfig::default())
    }

    /// Create a proxy with custom registry configuration
    pub fn with_config(
        key_func: Arc<dyn KeyFunc>,
        local_proxy: Arc<dyn Handler>,
        lb: Arc<dyn Handler>,
        config: RegistryConfig,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::with_config(
            key_func,
            Arc::clone(&lb),
            config,
        ));
        Self {
            local_proxy,
            lb,
            registry,
            stats: DispatchStats::new(),
        }
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Routing counters
    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// Route one request; errors are written to `sink` as API status objects
    pub async fn dispatch(&self, req: ProxyRequest, sink: Arc<dyn ResponseSink>) {
        let description = req_string(&req);

        let Some(info) = request_info(&req) else {
            let err = Error::Unsupported(description);
            tracing::error!(error = %err, "Rejecting non-resource request");
            self.stats.record_rejected();
            self.respond_error(sink.as_ref(), &err).await;
            return;
        };
        let verb = info.verb.clone();

        tracing::debug!(request = %description, verb = %verb, "Dispatching resource request");

        let result = match verb {
            Verb::Watch => {
                self.stats.record_watch();
                self.registry
                    .attach_or_create(&req, Some(Arc::clone(&sink)))
                    .await
            }
            ref mutating if mutating.is_mutating() => {
                self.stats.record_pass_through();
                self.lb.serve(req, Arc::clone(&sink)).await
            }
            _ => self.serve_read(req, Arc::clone(&sink)).await,
        };

        if let Err(err) = result {
            tracing::error!(request = %description, error = %err, "Could not site proxy request");
            self.stats.record_error();
            self.respond_error(sink.as_ref(), &err).await;
        }
    }

    async fn serve_read(&self, req: ProxyRequest, sink: Arc<dyn ResponseSink>) -> Result<()> {
        let (key, exists) = self.registry.is_watching(&req).await?;

        if exists {
            tracing::debug!(key = %key, "Serving read from local cache");
            self.stats.record_cache_read();
            return self.local_proxy.serve(req, sink).await;
        }

        // Start a session so the cache is kept current from now on; this
        // request cannot rely on the cache yet and goes upstream.
        if let Err(err) = self.registry.attach_or_create(&req, None).await {
            tracing::warn!(key = %key, error = %err, "Could not start watch session for read");
        }
        self.stats.record_pass_through();
        self.lb.serve(req, sink).await
    }

    async fn respond_error(&self, sink: &dyn ResponseSink, err: &Error) {
        if let Err(e) = write_error(sink, &err.status()).await {
            tracing::debug!(error = %e, "Could not write error response");
        }
    }
}

#[async_trait]
impl Handler for SiteProxy {
    async fn serve(&self, req: ProxyRequest, sink: Arc<dyn ResponseSink>) -> Result<()> {
        self.dispatch(req, sink).await;
        Ok(())
    }
}
