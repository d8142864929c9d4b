use camino::Utf8PathBuf;
use thiserror::Error;

use crate::handle::{GraphId, NodeId};

/// Misuse of tasks or handles while the pipeline is being defined.
///
/// These are raised immediately from the offending call and abort the
/// definition phase before anything runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphConstructionError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Invalid task name '{0}': use ASCII letters, digits, '_', '-' or '.', not starting with '.'")]
    InvalidTaskName(String),

    #[error("Parameter '{param}' is declared twice in the signature of '{task}'")]
    DuplicateParameter { task: String, param: String },

    #[error("Task '{0}' belongs to a different registry")]
    ForeignTask(String),

    #[error("Handle of {node} belongs to {found}, not to the open {expected}")]
    ForeignHandle {
        node: NodeId,
        expected: GraphId,
        found: GraphId,
    },

    #[error("Task '{task}' takes {expected} positional argument(s), {given} given")]
    TooManyArguments {
        task: String,
        expected: usize,
        given: usize,
    },

    #[error("Task '{task}' has no parameter named '{param}'")]
    UnknownParameter { task: String, param: String },

    #[error("Task '{task}' got multiple values for parameter '{param}'")]
    DuplicateArgument { task: String, param: String },

    #[error("Task '{task}' is missing required argument '{param}'")]
    MissingArgument { task: String, param: String },
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Couldn't create workspace {path}.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace {0} already exists and is not empty")]
    Conflict(Utf8PathBuf),

    #[error("Workspace {path} was already allocated to {owner}")]
    Reused { path: Utf8PathBuf, owner: NodeId },

    #[error("Workspace root {0} is not valid UTF-8 or not absolute")]
    Root(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Couldn't spawn worker '{program}'.\n{source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't build worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't locate the current executable.\n{0}")]
    CurrentExe(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors which stop `run()` before any node is dispatched.
///
/// Failing nodes are never reported this way, they end up in the
/// [`RunReport`](crate::RunReport).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("max_workers must be at least 1")]
    InvalidWorkers,

    #[error("Target {0} does not belong to this graph")]
    UnknownTarget(NodeId),

    #[error("A pipeline can't be run from inside a worker process")]
    InsideWorker,

    #[error("Error while preparing the workspace root:\n{0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Error while starting the execution backend:\n{0}")]
    Backend(#[from] BackendError),
}

/// Errors on the worker side of the process boundary.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Task '{0}' is not registered in the worker")]
    UnknownTask(String),

    #[error("Couldn't decode work unit.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode outcome.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
