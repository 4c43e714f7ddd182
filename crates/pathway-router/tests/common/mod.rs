//! Shared test support: a scriptable in-memory storage

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pathway_storage::{Application, RecordIter, Route, Storage, StorageError};

pub fn app(id: &str, url: &str) -> Result<Application, String> {
    Ok(Application {
        application_id: id.to_string(),
        backend_url: url.to_string(),
    })
}

pub fn route(path: &str, application: &str, kind: &str) -> Result<Route, String> {
    Ok(Route {
        incoming_path: path.to_string(),
        application_id: application.to_string(),
        route_type: kind.to_string(),
    })
}

#[derive(Default)]
struct Script {
    fail_open: bool,
    applications: Vec<Result<Application, String>>,
    routes: Vec<Result<Route, String>>,
    opens: usize,
    closes: usize,
}

/// Scriptable storage. Tests keep a clone to rescript the contents between
/// reloads; the clone handed to the router shares the same script.
#[derive(Clone, Default)]
pub struct MockStorage {
    script: Arc<Mutex<Script>>,
    connected: bool,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.script.lock().unwrap().fail_open = fail;
    }

    pub fn set_applications(&self, applications: Vec<Result<Application, String>>) {
        self.script.lock().unwrap().applications = applications;
    }

    pub fn set_routes(&self, routes: Vec<Result<Route, String>>) {
        self.script.lock().unwrap().routes = routes;
    }

    pub fn opens(&self) -> usize {
        self.script.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.script.lock().unwrap().closes
    }
}

#[async_trait]
impl Storage for MockStorage {
    async fn open(&mut self) -> Result<(), StorageError> {
        let mut script = self.script.lock().unwrap();
        script.opens += 1;
        if script.fail_open {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "storage open failed",
            )));
        }
        drop(script);

        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.script.lock().unwrap().closes += 1;
        self.connected = false;
    }

    fn applications(&self) -> Result<RecordIter<Application>, StorageError> {
        if !self.connected {
            return Err(StorageError::NotConnected);
        }
        let records = self.script.lock().unwrap().applications.clone();
        Ok(Box::new(
            records
                .into_iter()
                .map(|record| record.map_err(StorageError::Iteration)),
        ))
    }

    fn routes(&self) -> Result<RecordIter<Route>, StorageError> {
        if !self.connected {
            return Err(StorageError::NotConnected);
        }
        let records = self.script.lock().unwrap().routes.clone();
        Ok(Box::new(
            records
                .into_iter()
                .map(|record| record.map_err(StorageError::Iteration)),
        ))
    }
}
