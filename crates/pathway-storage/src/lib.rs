//! Route configuration storage
//!
//! The router rebuilds its routing table from a [`Storage`]: an external
//! store yielding two record sequences, applications (backend definitions)
//! and routes (path to application bindings). The store is opened at the
//! start of each reload and closed before the reload returns.

pub mod file;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileStorage;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("iteration failed: {0}")]
    Iteration(String),
}

/// A backend definition consumed during a reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub application_id: String,
    pub backend_url: String,
}

/// A path binding consumed during a reload
///
/// `route_type` of `"prefix"` makes the route match its path and every
/// descendant; any other value means an exact route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub incoming_path: String,
    pub application_id: String,
    pub route_type: String,
}

/// Lazy record sequence. An `Err` item is the terminal iteration error;
/// records after it need not be consumed.
pub type RecordIter<T> = Box<dyn Iterator<Item = Result<T, StorageError>> + Send>;

/// A source of applications and routes
#[async_trait]
pub trait Storage: Send + Sync {
    /// Establish the connection. Called once at the start of each reload.
    async fn open(&mut self) -> Result<(), StorageError>;

    /// Release the connection. Called exactly once per reload, on every
    /// path out of it.
    async fn close(&mut self);

    /// Yield the application records. Fails if the storage is not open.
    fn applications(&self) -> Result<RecordIter<Application>, StorageError>;

    /// Yield the route records. Fails if the storage is not open.
    fn routes(&self) -> Result<RecordIter<Route>, StorageError>;
}
