//! Watch-multiplexing proxy in front of one or more API servers
//!
//! Run with: cargo run --example site_proxy UPSTREAM... [--bind BIND_ADDR]
//!
//! Examples:
//!   cargo run --example site_proxy http://10.0.0.1:8080
//!   cargo run --example site_proxy http://10.0.0.1:8080 http://10.0.0.2:8080 --bind localhost:10261
//!
//! Then point several clients at the proxy:
//!   curl -N 'http://localhost:10261/api/v1/namespaces/default/pods?watch=true'
//!
//! Every client watching the same resource shares one upstream watch.
//! This demo has no local cache, so reads that would hit the cache are
//! answered by the upstream as well.

use std::net::SocketAddr;
use std::sync::Arc;

use watch_mux::registry::StorageKeyFunc;
use watch_mux::server::config::DEFAULT_PORT;
use watch_mux::transport::{HttpUpstream, UpstreamConfig};
use watch_mux::{ProxyServer, ServerConfig, SiteProxy};

/// Parse bind address from string
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:10261
/// - "127.0.0.1:8443" -> 127.0.0.1:8443
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: site_proxy UPSTREAM... [--bind BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  UPSTREAM     Base URI of an API server, e.g. http://10.0.0.1:8080");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:{DEFAULT_PORT})");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ServerConfig::default();
    let mut upstream = UpstreamConfig::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--bind" {
            let Some(addr) = args.next() else {
                print_usage();
                std::process::exit(1);
            };
            match parse_bind_addr(&addr) {
                Ok(addr) => config = config.bind(addr),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        } else {
            upstream = upstream.server(arg.parse()?);
        }
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("watch_mux=debug".parse()?)
                .add_directive("site_proxy=debug".parse()?),
        )
        .init();

    let lb = Arc::new(HttpUpstream::new(upstream)?);
    let proxy = SiteProxy::new(Arc::new(StorageKeyFunc), lb.clone(), lb);
    let server = ProxyServer::new(config, proxy);

    println!("Starting watch proxy on {}", server.bind_addr());

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await?;

    Ok(())
}
