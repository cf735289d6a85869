//! Proxy server listener
//!
//! Handles the TCP accept loop and serves each connection over HTTP/1.1.
//! Every request is resolved into [`RequestInfo`](crate::request::RequestInfo),
//! handed to the [`SiteProxy`] on its own task, and answered as soon as the
//! proxy commits a response head.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::proxy::SiteProxy;
use crate::registry::SessionRegistry;
use crate::request::{ClientComponent, RequestInfoResolver};
use crate::server::config::ServerConfig;
use crate::sink::BodySink;
use crate::status::ApiStatus;

/// Body type of every response the server sends
pub type ProxyBody = BoxBody<Bytes, Infallible>;

/// How long open connections get to finish after shutdown
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct RequestLimits {
    max_body_size: usize,
    response_buffer: usize,
}

/// Watch-multiplexing proxy server
pub struct ProxyServer {
    config: ServerConfig,
    proxy: Arc<SiteProxy>,
    resolver: Arc<RequestInfoResolver>,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Create a new server with the given configuration and proxy
    pub fn new(config: ServerConfig, proxy: SiteProxy) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            proxy: Arc::new(proxy),
            resolver: Arc::new(RequestInfoResolver::new()),
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get a reference to the proxy
    pub fn proxy(&self) -> &Arc<SiteProxy> {
        &self.proxy
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.proxy.registry()
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Proxy server listening");

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        self.shutdown.cancel();
        self.proxy.registry().shutdown().await;

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            connection_id = connection_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let proxy = Arc::clone(&self.proxy);
        let resolver = Arc::clone(&self.resolver);
        let shutdown = self.shutdown.clone();
        let limits = RequestLimits {
            max_body_size: self.config.max_body_size,
            response_buffer: self.config.response_buffer,
        };

        tokio::spawn(async move {
            let _permit = permit;

            let service = service_fn(move |req| {
                let proxy = Arc::clone(&proxy);
                let resolver = Arc::clone(&resolver);
                async move {
                    Ok::<_, Infallible>(handle_request(&proxy, &resolver, limits, req).await)
                }
            });

            let conn = http1::Builder::new().serve_connection(TokioIo::new(socket), service);
            tokio::pin!(conn);

            tokio::select! {
                result = &mut conn => {
                    if let Err(e) = result {
                        tracing::debug!(connection_id = connection_id, error = %e, "Connection error");
                    }
                }
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, conn).await;
                }
            }

            tracing::debug!(connection_id = connection_id, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

async fn handle_request(
    proxy: &Arc<SiteProxy>,
    resolver: &RequestInfoResolver,
    limits: RequestLimits,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let info = resolver.resolve(req.method(), req.uri());
    let component = component_from_user_agent(req.headers());

    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, limits.max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let status = if e.downcast_ref::<LengthLimitError>().is_some() {
                ApiStatus::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("request body exceeds {} bytes", limits.max_body_size),
                )
            } else {
                ApiStatus::bad_request(format!("could not read request body: {e}"))
            };
            return status_response(&status);
        }
    };

    let cancel = CancellationToken::new();
    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(info);
    if let Some(component) = component {
        req.extensions_mut().insert(ClientComponent(component));
    }
    req.extensions_mut().insert(cancel.clone());

    let (sink, head_rx, body) = BodySink::channel(limits.response_buffer, cancel);
    let sink = Arc::new(sink);
    let proxy = Arc::clone(proxy);
    let dispatch = tokio::spawn(async move {
        proxy.dispatch(req, sink.clone()).await;
        sink.finish();
    });

    match head_rx.await {
        Ok(head) => {
            let mut response = Response::new(body.boxed());
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            response
        }
        // Sink dropped unfinished: the dispatch task panicked or was aborted
        Err(_) => {
            if let Err(e) = dispatch.await {
                tracing::error!(error = %e, "Request handler failed");
            }
            status_response(&ApiStatus::internal("request finished without a response"))
        }
    }
}

fn status_response(status: &ApiStatus) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(status.to_body()).boxed());
    *response.status_mut() = status.code;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Client component named by the product token of the User-Agent
///
/// `kubelet/v1.28.2 (linux/amd64) kubernetes/89a4ea3` belongs to `kubelet`.
pub fn component_from_user_agent(headers: &HeaderMap) -> Option<String> {
    let agent = headers.get(USER_AGENT)?.to_str().ok()?;
    let product = agent.split('/').next()?.trim();
    if product.is_empty() {
        None
    } else {
        Some(product.to_string())
    }
}
