//! Reverse proxy backend handler
//!
//! Uses hyper with connection pooling to forward HTTP requests to a single
//! upstream target. This provides:
//! - Proper HTTP parsing (request/response boundaries)
//! - Connection pooling (reuses TCP connections)
//! - HTTP/1.1 keep-alive support
//!
//! If the target URL carries a path, request paths are re-rooted onto it:
//! a target of `http://app.internal/foo` turns a request for `/bar` into an
//! upstream request for `/foo/bar`.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use pathway_mux::Backend;
use url::Url;

/// Maximum number of pooled keep-alive connections per target
const MAX_POOL_SIZE: usize = 20;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("backend URL has no host: {0}")]
    MissingHost(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("response error: {0}")]
    ResponseError(String),
}

/// Reverse proxy handler for a single upstream target
pub struct ProxyBackend {
    target: Url,
    /// host:port dialed for upstream connections
    authority: String,
    /// Host header sent upstream
    host_header: HeaderValue,
    pool: Mutex<Vec<http1::SendRequest<Full<Bytes>>>>,
}

impl ProxyBackend {
    /// Create a proxy handler for the given target URL. The URL must be
    /// absolute, use the `http` scheme, and name a host.
    pub fn new(target: Url) -> Result<Self, ProxyError> {
        if target.scheme() != "http" {
            return Err(ProxyError::UnsupportedScheme(target.scheme().to_string()));
        }

        let host = target
            .host_str()
            .ok_or_else(|| ProxyError::MissingHost(target.to_string()))?;
        let port = target.port_or_known_default().unwrap_or(80);
        let authority = format!("{}:{}", host, port);

        let host_header = match target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let host_header = HeaderValue::from_str(&host_header)
            .map_err(|e| ProxyError::MissingHost(format!("{}: {}", target, e)))?;

        Ok(Self {
            target,
            authority,
            host_header,
            pool: Mutex::new(Vec::new()),
        })
    }

    /// The target URL this handler forwards to.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Get a connection to the target, reusing a pooled one if available.
    async fn get_connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    trace!("reusing pooled connection to {}", self.authority);
                    return Ok(sender);
                }
                trace!("discarding stale connection from pool");
            }
        }

        debug!("creating new connection to {}", self.authority);
        let stream = TcpStream::connect(&self.authority).await.map_err(|e| {
            ProxyError::ConnectionFailed(format!("failed to connect to {}: {}", self.authority, e))
        })?;

        let io = TokioIo::new(stream);

        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| ProxyError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    /// Return a connection to the pool if it is still usable.
    async fn return_connection(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            trace!("not returning closed connection to pool");
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
            trace!("returned connection to pool (size: {})", pool.len());
        }
    }

    /// Rewrite an incoming request for the upstream: re-root the path onto
    /// the target's path and point the Host header at the target.
    fn rewrite_request(&self, req: Request<Full<Bytes>>) -> Result<Request<Full<Bytes>>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        let path = join_paths(self.target.path(), parts.uri.path());
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        parts.uri = path_and_query
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad upstream path: {}", e)))?;

        parts.headers.insert(HOST, self.host_header.clone());

        Ok(Request::from_parts(parts, body))
    }

    /// Forward a request to the upstream and buffer the full response.
    async fn forward(&self, req: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>, ProxyError> {
        let outgoing = self.rewrite_request(req)?;

        let mut sender = self.get_connection().await?;

        let response = sender
            .send_request(outgoing)
            .await
            .map_err(|e| ProxyError::RequestFailed(format!("failed to send request: {}", e)))?;

        self.return_connection(sender).await;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::ResponseError(format!("failed to read response body: {}", e)))?
            .to_bytes();

        let mut builder = Response::builder().status(parts.status);
        for (name, value) in parts.headers.iter() {
            // The buffered body is re-framed with a fresh content-length
            if name == &TRANSFER_ENCODING || name == &CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder
            .body(Full::new(body))
            .map_err(|e| ProxyError::ResponseError(format!("failed to build response: {}", e)))
    }
}

#[async_trait]
impl Backend for ProxyBackend {
    async fn serve(&self, req: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.forward(req).await {
            Ok(response) => {
                trace!(
                    "proxied {} {} -> {} ({})",
                    method,
                    path,
                    self.authority,
                    response.status()
                );
                response
            }
            Err(e) => {
                error!("proxy error for {} {}: {}", method, path, e);
                bad_gateway(&e)
            }
        }
    }
}

fn bad_gateway(error: &ProxyError) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(error.to_string())));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

/// Join two path fragments with exactly one slash between them.
fn join_paths(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}
