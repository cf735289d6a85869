//! Handler seam for collaborators
//!
//! The upstream load balancer and the local cache reader are both plain
//! handlers: they take a request and write a response into a sink.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::ProxyRequest;
use crate::sink::ResponseSink;

/// Serves one request into a response sink
///
/// On `Err` the handler must not have written anything to the sink; the
/// caller is then responsible for answering with the error.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, req: ProxyRequest, sink: Arc<dyn ResponseSink>) -> Result<()>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn serve(&self, req: ProxyRequest, sink: Arc<dyn ResponseSink>) -> Result<()> {
        (**self).serve(req, sink).await
    }
}
