//! Runs in its own test binary: it marks the whole process as a worker.

use pipewright::{Args, Registry, RunError, RunOptions, Scheduler, Signature, ThreadBackend, worker};
use serde_json::json;

#[test]
fn workers_refuse_to_run_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let root = camino::Utf8PathBuf::from_path_buf(dir.path().join("work")).unwrap();
    let outcome = dir.path().join("outcome");

    let mut registry = Registry::new();
    let echo = registry
        .register("echo", Signature::of(["x"]), |ctx| Ok(ctx.input("x")?.clone()))
        .unwrap();
    let mut p = registry.pipeline();
    echo.call(&mut p, Args::new().arg(json!(1))).unwrap();
    let graph = p.finish();

    // SAFETY: this is the only test in this binary, nothing reads the
    // environment concurrently.
    unsafe { std::env::set_var(worker::WORKER_ENV, &outcome) };
    assert!(worker::is_worker());

    let err = Scheduler::new(&graph, RunOptions::new(root.clone()))
        .backend(ThreadBackend::new(1).unwrap())
        .run()
        .unwrap_err();
    assert!(matches!(err, RunError::InsideWorker), "{err}");

    // Refused before anything was touched.
    assert!(!root.exists());
    assert!(!outcome.exists());
}
