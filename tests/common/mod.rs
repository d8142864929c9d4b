#![allow(dead_code)]

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use pipewright::backend::{Completion, WorkUnit};
use pipewright::{Backend, BackendError, NodeId, ThreadBackend};
use tempfile::TempDir;

/// A fresh workspace root inside a temporary directory. Keep the `TempDir`
/// alive for as long as the root is used.
pub fn workdir() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().join("work")).expect("utf-8 tempdir");
    (dir, root)
}

/// Thread backend that remembers which nodes were submitted, in order.
pub struct Recording {
    inner: ThreadBackend,
    pub submitted: Arc<Mutex<Vec<NodeId>>>,
}

impl Recording {
    pub fn new(threads: usize) -> Self {
        Self {
            inner: ThreadBackend::new(threads).expect("thread pool"),
            submitted: Arc::default(),
        }
    }

    pub fn log(&self) -> Arc<Mutex<Vec<NodeId>>> {
        self.submitted.clone()
    }
}

impl Backend for Recording {
    fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight()
    }

    fn submit(&mut self, unit: WorkUnit, done: Sender<Completion>) -> Result<(), BackendError> {
        self.submitted.lock().unwrap().push(unit.node().clone());
        self.inner.submit(unit, done)
    }
}

/// Backend which refuses every unit.
pub struct Refusing;

impl Backend for Refusing {
    fn max_in_flight(&self) -> usize {
        1
    }

    fn submit(&mut self, _: WorkUnit, _: Sender<Completion>) -> Result<(), BackendError> {
        Err(BackendError::Io(std::io::Error::other("pool is gone")))
    }
}

/// Shared event log for ordering assertions.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn position(&self, event: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event '{event}' not recorded"))
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }
}
