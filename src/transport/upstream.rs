//! HTTP upstream load balancer
//!
//! Forwards requests to the configured API servers in round-robin order over
//! a pooled hyper client and streams the response body into the sink frame by
//! frame. Watch responses therefore reach the session as soon as the upstream
//! flushes them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderName;
use http::uri::{PathAndQuery, Uri};
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use super::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::proxy::Handler;
use crate::request::{cancellation, ProxyRequest};
use crate::sink::ResponseSink;
use crate::status::ApiStatus;

type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Round-robin HTTP load balancer over the upstream API servers
pub struct HttpUpstream {
    servers: Vec<Uri>,
    next: AtomicUsize,
    client: UpstreamClient,
}

impl HttpUpstream {
    /// Create a load balancer; at least one server is required
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(Error::Api(ApiStatus::service_unavailable(
                "no upstream servers configured",
            )));
        }

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build_http::<Full<Bytes>>();

        Ok(Self {
            servers: config.servers,
            next: AtomicUsize::new(0),
            client,
        })
    }

    /// Servers in rotation order
    pub fn servers(&self) -> &[Uri] {
        &self.servers
    }

    fn pick(&self) -> &Uri {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        &self.servers[index]
    }
}

#[async_trait]
impl Handler for HttpUpstream {
    async fn serve(&self, req: ProxyRequest, sink: Arc<dyn ResponseSink>) -> Result<()> {
        let cancel = cancellation(&req);
        let base = self.pick();
        let target = join_uri(base, req.uri())?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&target);
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name) {
                builder = builder.header(name, value);
            }
        }
        let upstream_req = builder.body(Full::new(body)).map_err(|e| {
            Error::Api(ApiStatus::internal(format!(
                "could not build upstream request: {e}"
            )))
        })?;

        tracing::debug!(target = %target, "Forwarding request upstream");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = self.client.request(upstream_req) => response.map_err(|e| {
                tracing::warn!(server = %base, error = %e, "Upstream request failed");
                Error::Api(ApiStatus::service_unavailable(format!(
                    "upstream {base} is unavailable: {e}"
                )))
            })?,
        };

        let (head, mut body) = response.into_parts();
        for (name, value) in head.headers.iter() {
            if !is_hop_by_hop_header(name) {
                sink.insert_header(name.clone(), value.clone());
            }
        }
        sink.write_header(head.status);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = body.frame() => frame,
            };

            match frame {
                None => break,
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if data.is_empty() {
                        continue;
                    }
                    if let Err(e) = sink.write(data).await {
                        tracing::debug!(target = %target, error = %e, "Downstream went away");
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(target = %target, error = %e, "Upstream body failed");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Resolve a request's path and query against an upstream base URI
pub fn join_uri(base: &Uri, uri: &Uri) -> Result<Uri> {
    let prefix = base.path().trim_end_matches('/');
    let tail = uri.path_and_query().map(PathAndQuery::as_str).unwrap_or("/");
    let tail = if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{tail}")
    };

    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(
        format!("{prefix}{tail}")
            .parse()
            .map_err(|e| Error::Api(ApiStatus::bad_request(format!("invalid request uri: {e}"))))?,
    );
    Uri::from_parts(parts)
        .map_err(|e| Error::Api(ApiStatus::internal(format!("invalid upstream uri: {e}"))))
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}
