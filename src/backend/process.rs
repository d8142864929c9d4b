use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::Sender;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;

use crate::backend::{Backend, Completion, Outcome, WorkUnit};
use crate::diagnostics::TaskError;
use crate::error::BackendError;
use crate::worker::WORKER_ENV;

/// Runs every unit in a fresh OS process.
///
/// The worker program is re-executed with [`WORKER_ENV`] pointing at the file
/// where it must leave its outcome. The unit itself arrives on stdin. The
/// program has to call [`worker::enter`](crate::worker::enter) with the same
/// task registry before doing anything else.
///
/// Child stdout and stderr are inherited, so task output shows up in the
/// coordinator's terminal.
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    slots: usize,
    pool: rayon::ThreadPool,
}

impl ProcessBackend {
    /// Re-execute the running binary as the worker.
    pub fn current_exe(slots: usize) -> Result<Self, BackendError> {
        let program = std::env::current_exe().map_err(BackendError::CurrentExe)?;
        Self::new(program, slots)
    }

    pub fn new(program: impl Into<PathBuf>, slots: usize) -> Result<Self, BackendError> {
        let slots = slots.max(1);
        // One waiter thread per live child, they spend their time blocked.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(slots)
            .thread_name(|i| format!("pipewright-waiter-{i}"))
            .build()?;

        Ok(Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            slots,
            pool,
        })
    }

    /// Extra arguments passed to every worker process.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Extra environment variable for every worker process.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    fn spawn(&self, outcome: &Utf8Path) -> Result<Child, BackendError> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ENV, outcome)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.program.display().to_string(),
                source,
            })
    }
}

impl Backend for ProcessBackend {
    fn max_in_flight(&self) -> usize {
        self.slots
    }

    fn submit(&mut self, unit: WorkUnit, done: Sender<Completion>) -> Result<(), BackendError> {
        let outcome_path = outcome_path(&unit);
        match fs::remove_file(&outcome_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let started_at = Utc::now();
        let mut child = self.spawn(&outcome_path)?;
        tracing::trace!(node = %unit.node(), pid = child.id(), "spawned worker");

        self.pool.spawn(move || {
            if let Some(stdin) = child.stdin.take() {
                let mut writer = BufWriter::new(stdin);
                let sent = ciborium::into_writer(&unit.payload, &mut writer)
                    .map_err(|err| err.to_string())
                    .and_then(|()| writer.flush().map_err(|err| err.to_string()));
                // A worker dying early shows up as a broken pipe here and as
                // an abnormal exit below.
                if let Err(err) = sent {
                    tracing::debug!(node = %unit.node(), error = %err, "couldn't send unit to worker");
                }
            }

            let outcome = match child.wait() {
                Ok(status) => collect(&unit, &outcome_path, status),
                Err(err) => Err(TaskError::worker_crash(
                    format!("Couldn't wait for worker of {}", unit.node()),
                    format!("{err:?}"),
                )),
            };
            let _ = fs::remove_file(&outcome_path);
            let _ = done.send(unit.complete(outcome, started_at));
        });

        Ok(())
    }
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("slots", &self.slots)
            .finish()
    }
}

fn outcome_path(unit: &WorkUnit) -> Utf8PathBuf {
    let node = unit.node();
    unit.scratch_dir()
        .join(format!("{}.{}.outcome", node.task(), node.invocation()))
}

/// Read what the worker left behind. A missing or unreadable outcome means the
/// worker died before it could report.
fn collect(unit: &WorkUnit, path: &Utf8Path, status: ExitStatus) -> Outcome {
    let reported = File::open(path)
        .map_err(|err| err.to_string())
        .and_then(|file| {
            ciborium::from_reader::<Outcome, _>(BufReader::new(file)).map_err(|err| err.to_string())
        });

    match reported {
        Ok(outcome) => outcome,
        Err(reason) => Err(TaskError::worker_crash(
            format!("Worker of {} exited abnormally ({})", unit.node(), describe(status)),
            format!("exit status: {status:?}\noutcome file {path}: {reason}"),
        )),
    }
}

#[cfg(unix)]
fn describe(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => status.to_string(),
    }
}

#[cfg(not(unix))]
fn describe(status: ExitStatus) -> String {
    status.to_string()
}
