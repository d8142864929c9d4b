//! Pluggable execution backends.
//!
//! The scheduler talks to a [`Backend`] instead of a concrete worker pool. It
//! hands over one [`WorkUnit`] at a time, as soon as the unit becomes ready,
//! and the backend reports back with a [`Completion`] over the channel it was
//! given. The scheduler never looks inside the pool.
//!
//! - [`ProcessBackend`] is the default. Each unit runs in a separate OS
//!   process, so a crashing task cannot take the coordinator down.
//! - [`ThreadBackend`] runs units on a rayon pool inside the current process.
//!   It is useful for tests and for bodies which cannot be re-executed.
//! - Tests may provide their own implementation, e.g. one that records what
//!   was submitted and completes units immediately.

mod process;
mod thread;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use process::ProcessBackend;
pub use thread::ThreadBackend;

use crate::config::ConfigMap;
use crate::diagnostics::{TaskError, take_panic_trace};
use crate::error::BackendError;
use crate::handle::NodeId;
use crate::task::{Inputs, TaskContext, TaskDef};

/// Result of running one unit: the produced value or a captured failure.
pub type Outcome = Result<Value, TaskError>;

/// The part of a unit of work which crosses the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitPayload {
    pub node: NodeId,
    pub task: String,
    pub inputs: Inputs,
    pub workspace: Utf8PathBuf,
    pub config: ConfigMap,
}

/// One ready invocation, with all inputs resolved and its workspace created.
#[derive(Debug)]
pub struct WorkUnit {
    pub(crate) index: NodeIndex,
    pub(crate) task: Arc<TaskDef>,
    pub(crate) payload: UnitPayload,
    pub(crate) scratch: Utf8PathBuf,
}

impl WorkUnit {
    pub fn node(&self) -> &NodeId {
        &self.payload.node
    }

    pub fn task(&self) -> &TaskDef {
        &self.task
    }

    pub fn payload(&self) -> &UnitPayload {
        &self.payload
    }

    /// Directory under the workspace root reserved for engine bookkeeping.
    pub fn scratch_dir(&self) -> &Utf8Path {
        &self.scratch
    }

    /// Run the body in the calling thread, catching errors and panics.
    pub fn execute(&self) -> Outcome {
        execute(&self.task, &self.payload)
    }

    /// Package an outcome of this unit for the scheduler.
    pub fn complete(&self, outcome: Outcome, started_at: DateTime<Utc>) -> Completion {
        Completion {
            index: self.index,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// What a backend sends back for every submitted unit, exactly once.
#[derive(Debug)]
pub struct Completion {
    pub(crate) index: NodeIndex,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Interface to a pool of parallel workers.
pub trait Backend: Send {
    /// Upper bound on units running at the same time.
    fn max_in_flight(&self) -> usize;

    /// Start executing `unit`. The backend must eventually send exactly one
    /// [`Completion`] for it on `done`, also when the worker dies.
    ///
    /// Returning an error means the unit could not be dispatched at all. The
    /// scheduler then fails the node itself and expects no completion.
    fn submit(&mut self, unit: WorkUnit, done: Sender<Completion>) -> Result<(), BackendError>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn max_in_flight(&self) -> usize {
        (**self).max_in_flight()
    }

    fn submit(&mut self, unit: WorkUnit, done: Sender<Completion>) -> Result<(), BackendError> {
        (**self).submit(unit, done)
    }
}

pub(crate) fn execute(task: &TaskDef, payload: &UnitPayload) -> Outcome {
    let context = TaskContext {
        node: &payload.node,
        inputs: &payload.inputs,
        workspace: &payload.workspace,
        config: &payload.config,
    };

    // Task bodies only see their own inputs, so an unwinding body cannot leave
    // shared state half-updated.
    match catch_unwind(AssertUnwindSafe(|| task.call(&context))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskError::from_anyhow(&err)),
        Err(panic) => Err(TaskError::from_panic(&*panic, take_panic_trace())),
    }
}
