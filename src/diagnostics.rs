//! Structured failure data.
//!
//! Failures never travel between the coordinator and a worker as live error
//! objects. They are flattened into a [`TaskError`] holding the kind, the
//! message and a formatted diagnostic trace, which serialises across the
//! process boundary and ends up in the run report.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What went wrong with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The task body returned an error or panicked.
    TaskException,
    /// The worker running the task died or could not be dispatched.
    WorkerCrash,
    /// The per-invocation workspace could not be allocated.
    Workspace,
    /// Not an error of this node: an ancestor failed, so it never ran.
    CancelledDueToFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskException => write!(f, "task exception"),
            Self::WorkerCrash => write!(f, "worker crash"),
            Self::Workspace => write!(f, "workspace"),
            Self::CancelledDueToFailure => write!(f, "cancelled due to failure"),
        }
    }
}

/// A captured failure, plain data only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Formatted diagnostic: cause chain, backtrace or process exit details.
    pub trace: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Flatten an error returned by a task body.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::new(ErrorKind::TaskException, err.to_string(), format!("{err:?}"))
    }

    /// Flatten a panic payload caught with `catch_unwind`.
    pub fn from_panic(payload: &(dyn Any + Send), trace: Option<String>) -> Self {
        let message = panic_message(payload);
        let trace = trace.unwrap_or_else(|| message.clone());
        Self::new(ErrorKind::TaskException, message, trace)
    }

    pub fn worker_crash(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerCrash, message, trace)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Install a panic hook recording location and backtrace of the last panic
/// on the panicking thread. Only the worker process does this, the
/// coordinator never touches the global hook.
pub(crate) fn install_panic_capture() {
    std::panic::set_hook(Box::new(|info| {
        let trace = format!("{info}\n\nstack backtrace:\n{}", Backtrace::force_capture());
        LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(trace));
    }));
}

pub(crate) fn take_panic_trace() -> Option<String> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}
