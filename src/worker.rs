//! Worker side of the [`ProcessBackend`](crate::backend::ProcessBackend).
//!
//! A binary using the process backend must call [`enter`] at the top of
//! `main`, with the same task registry the pipeline is built from:
//!
//! ```no_run
//! use pipewright::{Registry, worker};
//!
//! fn registry() -> Registry {
//!     Registry::new()
//! }
//!
//! fn main() {
//!     worker::enter(&registry());
//!     // coordinator code follows
//! }
//! ```
//!
//! In a coordinator process `enter` returns immediately. In a worker process
//! it runs exactly one unit and exits.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::backend::{Outcome, UnitPayload, execute};
use crate::diagnostics::{TaskError, install_panic_capture};
use crate::error::WorkerError;
use crate::task::Registry;

/// Environment variable marking a worker process. Holds the path of the file
/// the outcome has to be written to.
pub const WORKER_ENV: &str = "PIPEWRIGHT_WORKER_OUTCOME";

/// Whether the current process was started as a worker.
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Serve one unit of work if this process is a worker, then exit.
pub fn enter(registry: &Registry) {
    let Some(outcome) = std::env::var_os(WORKER_ENV) else {
        return;
    };

    let code = match serve(registry, &PathBuf::from(outcome)) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("pipewright worker: {err}");
            2
        }
    };
    std::process::exit(code);
}

fn serve(registry: &Registry, outcome_path: &Path) -> Result<(), WorkerError> {
    let payload: UnitPayload = ciborium::from_reader(std::io::stdin().lock())?;

    let outcome: Outcome = match registry.get(&payload.task) {
        Some(handle) => {
            install_panic_capture();
            execute(&handle.def, &payload)
        }
        None => Err(TaskError::worker_crash(
            WorkerError::UnknownTask(payload.task.clone()).to_string(),
            format!("registered tasks: {:?}", registry.names().collect::<Vec<_>>()),
        )),
    };

    let mut writer = BufWriter::new(File::create(outcome_path)?);
    ciborium::into_writer(&outcome, &mut writer)?;
    writer.flush()?;
    Ok(())
}
