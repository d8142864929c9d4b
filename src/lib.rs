#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod args;
pub mod backend;
mod config;
mod diagnostics;
mod error;
mod graph;
mod handle;
mod report;
mod scheduler;
mod task;
mod utils;
pub mod worker;
mod workspace;

pub use crate::args::{Arg, Args};
pub use crate::backend::{Backend, ProcessBackend, ThreadBackend};
pub use crate::config::ConfigMap;
pub use crate::diagnostics::{ErrorKind, TaskError};
pub use crate::error::*;
pub use crate::graph::{Graph, GraphBuilder, Invocation};
pub use crate::handle::{GraphId, NodeId, PendingResult};
pub use crate::report::{NodeReport, NodeState, RunReport, RunStatus};
pub use crate::scheduler::{RunOptions, Scheduler};
pub use crate::task::{Inputs, Param, Registry, Signature, TaskContext, TaskDef, TaskHandle, TaskResult};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::workspace::WorkspaceAllocator;
