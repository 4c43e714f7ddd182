//! JSON-file backed storage
//!
//! Reads a single JSON document of the form:
//!
//! ```json
//! {
//!   "applications": [
//!     { "application_id": "frontend", "backend_url": "http://127.0.0.1:3000" }
//!   ],
//!   "routes": [
//!     { "incoming_path": "/", "application_id": "frontend", "route_type": "prefix" }
//!   ]
//! }
//! ```
//!
//! The document is read and decoded by `open()`; a decode failure is a
//! terminal error for the reload that triggered it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Application, RecordIter, Route, Storage, StorageError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RouteDocument {
    #[serde(default)]
    applications: Vec<Application>,
    #[serde(default)]
    routes: Vec<Route>,
}

/// Storage backed by a JSON file on disk
pub struct FileStorage {
    path: PathBuf,
    document: Option<RouteDocument>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            document: None,
        }
    }

    fn document(&self) -> Result<&RouteDocument, StorageError> {
        self.document.as_ref().ok_or(StorageError::NotConnected)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn open(&mut self) -> Result<(), StorageError> {
        let raw = tokio::fs::read(&self.path).await?;
        let document: RouteDocument = serde_json::from_slice(&raw)?;
        debug!(
            "loaded {} ({} applications, {} routes)",
            self.path.display(),
            document.applications.len(),
            document.routes.len()
        );
        self.document = Some(document);
        Ok(())
    }

    async fn close(&mut self) {
        self.document = None;
    }

    fn applications(&self) -> Result<RecordIter<Application>, StorageError> {
        let records = self.document()?.applications.clone();
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn routes(&self) -> Result<RecordIter<Route>, StorageError> {
        let records = self.document()?.routes.clone();
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}
