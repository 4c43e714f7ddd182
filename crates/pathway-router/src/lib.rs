//! Front-door request handler and reload coordinator
//!
//! The `Router` holds the currently-active [`Mux`] and swaps it atomically
//! when the routing table is reloaded from storage. A reload builds a
//! complete new mux off to the side and publishes it only on success, so
//! requests never observe a partially constructed table; on any terminal
//! failure the previous mux keeps serving.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use pathway_mux::{BackendId, Mux};
use pathway_proxy::ProxyBackend;
use pathway_storage::{Storage, StorageError};

/// Terminal reload errors. Individual malformed records are logged and
/// skipped rather than reported here.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// HTTP front door whose routing table can be swapped at runtime
pub struct Router<S> {
    /// The serving mux. `None` until the first successful reload.
    active: RwLock<Option<Arc<Mux>>>,
    /// Storage is locked for the duration of a reload, which also
    /// serializes concurrent reload requests.
    storage: Mutex<S>,
}

impl<S: Storage> Router<S> {
    /// Create a router with no routes loaded. Requests are answered 503
    /// until the first successful [`reload_routes`](Self::reload_routes).
    pub fn new(storage: S) -> Self {
        Self {
            active: RwLock::new(None),
            storage: Mutex::new(storage),
        }
    }

    /// The mux currently answering requests, if any.
    pub async fn active_mux(&self) -> Option<Arc<Mux>> {
        self.active.read().await.clone()
    }

    /// Dispatch a request through the active mux.
    ///
    /// The active reference is read once; a reload that commits while this
    /// request is in flight takes effect for the next request, not this one.
    pub async fn handle(&self, req: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        match self.active_mux().await {
            Some(mux) => mux.serve(req).await,
            None => service_unavailable(),
        }
    }

    /// Rebuild the routing table from storage and atomically publish it.
    ///
    /// A new mux is populated from the storage contents and installed only
    /// if the whole rebuild succeeds; otherwise the previously published mux
    /// stays in place and the error is surfaced to the caller, who is
    /// responsible for scheduling a retry. Concurrent calls queue on the
    /// storage lock, so at most one rebuild runs at a time.
    pub async fn reload_routes(&self) -> Result<(), ReloadError> {
        let mut storage = self.storage.lock().await;

        info!("reloading routes");
        match rebuild(&mut *storage).await {
            Ok(mux) => {
                *self.active.write().await = Some(Arc::new(mux));
                info!("reloaded routes");
                Ok(())
            }
            Err(e) => {
                error!("route reload failed, keeping current routes: {}", e);
                Err(e)
            }
        }
    }
}

/// Open the storage, build a fresh mux from its contents, and close the
/// storage again on every path out.
async fn rebuild<S: Storage>(storage: &mut S) -> Result<Mux, ReloadError> {
    debug!("connecting to storage");
    storage.open().await?;

    let result = populate(storage).await;
    storage.close().await;
    result
}

async fn populate<S: Storage>(storage: &S) -> Result<Mux, ReloadError> {
    let mux = Mux::new();

    // Backends first: routes can only bind to applications seen here
    let mut backend_ids: HashMap<String, BackendId> = HashMap::new();
    for record in storage.applications()? {
        let application = record?;

        let target = match Url::parse(&application.backend_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    "couldn't parse URL {} for backend {} ({}), skipping",
                    application.backend_url, application.application_id, e
                );
                continue;
            }
        };

        let backend = match ProxyBackend::new(target) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(
                    "unusable backend URL {} for {} ({}), skipping",
                    application.backend_url, application.application_id, e
                );
                continue;
            }
        };

        let backend_id = mux.add_backend(Arc::new(backend)).await;
        backend_ids.insert(application.application_id, backend_id);
    }

    for record in storage.routes()? {
        let route = record?;

        let Some(&backend_id) = backend_ids.get(&route.application_id) else {
            warn!(
                "route {} references unknown application {}, skipping",
                route.incoming_path, route.application_id
            );
            continue;
        };

        let prefix = route.route_type == "prefix";
        mux.register(&route.incoming_path, prefix, backend_id).await;
    }

    Ok(mux)
}

fn service_unavailable() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(
        b"503 service unavailable\n",
    )));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}
