//! Path-routing reverse proxy server
//!
//! Accepts HTTP traffic on a single listen address and forwards each request
//! to the backend selected by the routing table. The table is loaded from a
//! JSON route document at startup and reloaded on SIGHUP without dropping
//! in-flight traffic.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pathway_router::Router;
use pathway_storage::FileStorage;

/// Serve a fleet of backends behind one URL hierarchy
#[derive(Parser, Debug)]
#[command(name = "pathway")]
#[command(about = "Path-routing reverse proxy", long_about = None)]
struct Cli {
    /// Listen address for incoming HTTP traffic
    #[arg(long, default_value = "0.0.0.0:8080", env = "PATHWAY_LISTEN")]
    listen: SocketAddr,

    /// Path to the JSON route document
    #[arg(long, env = "PATHWAY_ROUTES")]
    routes: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let router = Arc::new(Router::new(FileStorage::new(&cli.routes)));

    if let Err(e) = router.reload_routes().await {
        error!(
            "initial route load failed, serving 503 until a reload succeeds: {}",
            e
        );
    }

    #[cfg(unix)]
    spawn_reload_on_sighup(router.clone());

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind to {}", cli.listen))?;
    info!("listening on {}", cli.listen);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received, stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                tokio::spawn(serve_connection(router.clone(), stream, peer));
            }
        }
    }

    Ok(())
}

async fn serve_connection(router: Arc<Router<FileStorage>>, stream: TcpStream, peer: SocketAddr) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(handle(&router, peer, req).await) }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!("connection from {} ended: {}", peer, e);
    }
}

/// Buffer the request body, stamp the forwarding headers, and dispatch
/// through the router.
async fn handle(
    router: &Router<FileStorage>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let (mut parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body from {}: {}", peer, e);
            let mut response = Response::new(Full::new(Bytes::from_static(b"400 bad request\n")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return response;
        }
    };

    if let Ok(forwarded_for) = HeaderValue::from_str(&peer.ip().to_string()) {
        parts.headers.append("x-forwarded-for", forwarded_for);
    }

    router
        .handle(Request::from_parts(parts, Full::new(body)))
        .await
}

#[cfg(unix)]
fn spawn_reload_on_sighup(router: Arc<Router<FileStorage>>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!("failed to install SIGHUP handler: {}", e);
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading routes");
            if let Err(e) = router.reload_routes().await {
                error!("reload failed: {}", e);
            }
        }
    });
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
