//! Path multiplexer over registered backends
//!
//! The `Mux` owns a table of backend handlers and a trie of routes, and
//! answers lookups with longest-match semantics:
//!
//! 1. An exact entry at the request path always wins
//! 2. Otherwise the longest ancestor registered as a prefix route wins
//! 3. A prefix entry at the root acts as a catch-all
//!
//! A published mux is only read; the writer methods are used while a fresh
//! instance is being populated during a reload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::trie::Trie;

/// Identifier allocated by [`Mux::add_backend`], unique within one mux
pub type BackendId = usize;

/// An opaque request handler serving a single upstream
#[async_trait]
pub trait Backend: Send + Sync {
    /// Serve one request. Upstream failures are rendered by the handler
    /// itself (as 502 or similar); this never fails at the seam.
    async fn serve(&self, req: Request<Full<Bytes>>) -> Response<Full<Bytes>>;
}

/// Route entry stored at a trie node
#[derive(Debug, Clone, Copy)]
struct MuxEntry {
    prefix: bool,
    backend_id: BackendId,
}

struct MuxInner {
    next_backend_id: BackendId,
    backends: HashMap<BackendId, Arc<dyn Backend>>,
    trie: Trie<MuxEntry>,
}

/// Path multiplexer
pub struct Mux {
    inner: RwLock<MuxInner>,
}

impl Mux {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MuxInner {
                next_backend_id: 0,
                backends: HashMap::new(),
                trie: Trie::new(),
            }),
        }
    }

    /// Register a backend handler and return its allocated id.
    ///
    /// Ids are allocated strictly increasing from 0 and are never reused
    /// within the lifetime of this mux.
    pub async fn add_backend(&self, backend: Arc<dyn Backend>) -> BackendId {
        let mut inner = self.inner.write().await;
        let backend_id = inner.next_backend_id;
        inner.backends.insert(backend_id, backend);
        inner.next_backend_id += 1;
        backend_id
    }

    /// Retrieve the backend registered under the given id.
    pub async fn get_backend(&self, backend_id: BackendId) -> Option<Arc<dyn Backend>> {
        let inner = self.inner.read().await;
        inner.backends.get(&backend_id).cloned()
    }

    /// Register a route for the given path and associate it with a backend.
    ///
    /// A prefix route matches the path and any descendant; an exact route
    /// matches only the path itself. Registering overwrites any previous
    /// entry at the same normalized path. The backend id is not validated
    /// here; it resolves (or fails to) at serve time.
    pub async fn register(&self, path: &str, prefix: bool, backend_id: BackendId) {
        debug!(
            "registering route {} (prefix: {}) -> backend {}",
            path, prefix, backend_id
        );

        let mut inner = self.inner.write().await;
        let entry = MuxEntry { prefix, backend_id };
        inner.trie.set(&split_path(path), entry);
    }

    /// Look up the backend serving the given request path, applying the
    /// longest-match policy.
    pub async fn lookup(&self, path: &str) -> Option<BackendId> {
        let inner = self.inner.read().await;
        let entry = find_longest_match(&inner.trie, path)?;
        trace!(
            "lookup {} matched backend {} (prefix: {})",
            path,
            entry.backend_id,
            entry.prefix
        );
        Some(entry.backend_id)
    }

    /// Dispatch the request to the backend whose route matches the request
    /// path, or respond 404.
    pub async fn serve(&self, req: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let backend = {
            let inner = self.inner.read().await;
            find_longest_match(&inner.trie, req.uri().path())
                .and_then(|entry| inner.backends.get(&entry.backend_id).cloned())
        };

        match backend {
            Some(backend) => backend.serve(req).await,
            None => not_found(),
        }
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"404 page not found\n")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Split a slash-delimited path into its lookup key. Leading slashes are
/// stripped before splitting, so `/foo`, `foo`, and `///foo` produce the
/// same key, and `/` and the empty string both produce the empty key.
fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').collect()
}

/// Search the trie for the longest route matching the path.
///
/// An exact hit on the full path is returned unconditionally. Failing that,
/// segments are dropped from the end one at a time and each remaining key is
/// accepted only if it was registered as a prefix route. The empty key is
/// attempted last, so a prefix entry at the root matches any otherwise
/// unmatched path.
fn find_longest_match(trie: &Trie<MuxEntry>, path: &str) -> Option<MuxEntry> {
    let segments = split_path(path);
    let mut len = segments.len();

    loop {
        if let Some(entry) = trie.get(&segments[..len]) {
            if len == segments.len() || entry.prefix {
                return Some(*entry);
            }
        }

        if len == 0 {
            return None;
        }
        len -= 1;
    }
}
