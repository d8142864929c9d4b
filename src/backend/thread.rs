use std::sync::mpsc::Sender;

use chrono::Utc;

use crate::backend::{Backend, Completion, WorkUnit};
use crate::error::BackendError;

/// Runs units on a rayon thread pool inside the coordinating process.
///
/// Errors and panics of task bodies are captured, but a body that aborts the
/// process takes the whole run with it. Use [`ProcessBackend`] when that
/// matters.
///
/// [`ProcessBackend`]: crate::backend::ProcessBackend
pub struct ThreadBackend {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl ThreadBackend {
    pub fn new(threads: usize) -> Result<Self, BackendError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pipewright-worker-{i}"))
            .build()?;

        Ok(Self { pool, threads })
    }
}

impl Backend for ThreadBackend {
    fn max_in_flight(&self) -> usize {
        self.threads
    }

    fn submit(&mut self, unit: WorkUnit, done: Sender<Completion>) -> Result<(), BackendError> {
        self.pool.spawn(move || {
            let started_at = Utc::now();
            let outcome = unit.execute();
            // The receiver only disappears once the scheduler has given up.
            let _ = done.send(unit.complete(outcome, started_at));
        });

        Ok(())
    }
}

impl std::fmt::Debug for ThreadBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadBackend({})", self.threads)
    }
}
