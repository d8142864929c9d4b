//! Executing a [`Graph`].
//!
//! The scheduler works like a parallel topological sort:
//! 1. Count, for every selected node, how many of its producers are still
//!    outstanding. Nodes with no outstanding producers are ready.
//! 2. Hand ready nodes to the backend, in the order they became ready, until
//!    the concurrency limit is reached.
//! 3. Block until the backend reports one completion.
//! 4. On success, decrement the counts of the node's consumers and queue
//!    those which reach zero.
//! 5. On failure, walk all transitive consumers and cancel those that have
//!    not started. Unrelated branches keep going.
//! 6. Repeat until nothing is running and nothing is ready.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZero;
use std::sync::mpsc::{Receiver, Sender, channel};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use serde_json::Value;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::backend::{Backend, Completion, ProcessBackend, UnitPayload, WorkUnit};
use crate::config::ConfigMap;
use crate::diagnostics::{ErrorKind, TaskError};
use crate::error::RunError;
use crate::graph::Graph;
use crate::handle::PendingResult;
use crate::report::{NodeReport, NodeState, RunReport, RunStatus, cancellation};
use crate::task::Inputs;
use crate::workspace::{WorkspaceAllocator, link_inputs};

/// Engine knobs of a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub(crate) workspace_root: Utf8PathBuf,
    pub(crate) max_workers: usize,
    pub(crate) config: ConfigMap,
    pub(crate) targets: Vec<PendingResult>,
    pub(crate) link_inputs: bool,
}

impl RunOptions {
    /// Options with every workspace placed under `workspace_root` and one
    /// worker per available CPU.
    pub fn new(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_workers: default_workers(),
            config: ConfigMap::new(),
            targets: Vec::new(),
            link_inputs: false,
        }
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    /// Only run what is needed to produce `handle`. May be given repeatedly.
    pub fn target(mut self, handle: &PendingResult) -> Self {
        self.targets.push(handle.clone());
        self
    }

    pub fn targets<'a>(mut self, handles: impl IntoIterator<Item = &'a PendingResult>) -> Self {
        self.targets.extend(handles.into_iter().cloned());
        self
    }

    /// Symlink existing input paths into each workspace before the body runs.
    pub fn link_inputs(mut self, enabled: bool) -> Self {
        self.link_inputs = enabled;
        self
    }

    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZero::get)
        .unwrap_or(1)
}

type Callback<'g> = Box<dyn FnMut(&NodeReport) + 'g>;

/// Configurable entry point for running a graph.
///
/// [`Graph::run`] is the shorthand for the defaults: a [`ProcessBackend`]
/// re-executing the current binary and no callback.
pub struct Scheduler<'g> {
    graph: &'g Graph,
    options: RunOptions,
    backend: Option<Box<dyn Backend + 'g>>,
    on_complete: Option<Callback<'g>>,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g Graph, options: RunOptions) -> Self {
        Self {
            graph,
            options,
            backend: None,
            on_complete: None,
        }
    }

    pub fn backend(mut self, backend: impl Backend + 'g) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Called on the scheduling thread each time a node reaches a terminal
    /// state, cancellations included.
    pub fn on_node_complete(mut self, callback: impl FnMut(&NodeReport) + 'g) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Run the graph to completion.
    ///
    /// Only setup problems are returned as errors. Failing nodes end up in
    /// the report. Calling this from a worker process (see
    /// [`worker::is_worker`](crate::worker::is_worker)) fails with
    /// [`RunError::InsideWorker`].
    pub fn run(self) -> Result<RunReport, RunError> {
        let Scheduler {
            graph,
            options,
            backend,
            on_complete,
        } = self;

        // A worker re-running the host's pipeline would spawn workers of its own.
        if crate::worker::is_worker() {
            return Err(RunError::InsideWorker);
        }

        if options.max_workers == 0 {
            return Err(RunError::InvalidWorkers);
        }

        let mut targets = Vec::with_capacity(options.targets.len());
        for handle in &options.targets {
            if !graph.owns(handle) {
                return Err(RunError::UnknownTarget(handle.node_id().clone()));
            }
            targets.push(handle.index());
        }

        let workspaces = WorkspaceAllocator::new(&options.workspace_root)?;
        let scratch = workspaces.engine_dir()?;

        let backend: Box<dyn Backend + 'g> = match backend {
            Some(backend) => backend,
            None => Box::new(ProcessBackend::current_exe(options.max_workers)?),
        };
        let limit = options.max_workers.min(backend.max_in_flight()).max(1);

        let selected: Vec<NodeIndex> = if targets.is_empty() {
            graph.graph.node_indices().collect()
        } else {
            let needed = graph.ancestors_of(&targets);
            graph
                .graph
                .node_indices()
                .filter(|index| needed.contains(index))
                .collect()
        };

        tracing::info!(
            nodes = selected.len(),
            workers = limit,
            root = %workspaces.root(),
            "starting run"
        );

        let (done, completions) = channel();
        let mut run = Run {
            graph,
            config: options.config,
            link_inputs: options.link_inputs,
            workspaces,
            scratch,
            backend,
            on_complete,
            limit,
            done,
            slots: HashMap::new(),
            dependents: HashMap::new(),
            ready: VecDeque::new(),
            running: HashMap::new(),
            peak_running: 0,
            progress: Span::none(),
        };

        Ok(run.execute(&selected, completions))
    }
}

/// Book-keeping of one node during a run.
#[derive(Debug)]
struct Slot {
    state: NodeState,
    /// Producers which have not succeeded yet.
    remaining: usize,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    workspace: Option<Utf8PathBuf>,
    result: Option<Value>,
    error: Option<TaskError>,
    cancelled_by: Option<NodeIndex>,
}

impl Slot {
    fn new(remaining: usize) -> Self {
        Self {
            state: if remaining == 0 {
                NodeState::Ready
            } else {
                NodeState::Pending
            },
            remaining,
            started_at: None,
            finished_at: None,
            workspace: None,
            result: None,
            error: None,
            cancelled_by: None,
        }
    }
}

struct Run<'g> {
    graph: &'g Graph,
    config: ConfigMap,
    link_inputs: bool,
    workspaces: WorkspaceAllocator,
    scratch: Utf8PathBuf,
    backend: Box<dyn Backend + 'g>,
    on_complete: Option<Callback<'g>>,
    limit: usize,
    done: Sender<Completion>,
    slots: HashMap<NodeIndex, Slot>,
    dependents: HashMap<NodeIndex, Vec<NodeIndex>>,
    ready: VecDeque<NodeIndex>,
    /// Nodes handed to the backend, with their progress spans.
    running: HashMap<NodeIndex, Span>,
    peak_running: usize,
    progress: Span,
}

impl Run<'_> {
    fn execute(&mut self, selected: &[NodeIndex], completions: Receiver<Completion>) -> RunReport {
        let started_at = Utc::now();
        let graph = self.graph;
        let graph = &graph.graph;
        let in_run: HashSet<NodeIndex> = selected.iter().copied().collect();

        for edge in graph.raw_edges() {
            if in_run.contains(&edge.source()) && in_run.contains(&edge.target()) {
                self.dependents
                    .entry(edge.source())
                    .or_default()
                    .push(edge.target());
            }
        }

        for &index in selected {
            let remaining = graph
                .neighbors_directed(index, Direction::Incoming)
                .filter(|dep| in_run.contains(dep))
                .count();
            let slot = Slot::new(remaining);
            if slot.state == NodeState::Ready {
                self.ready.push_back(index);
            }
            self.slots.insert(index, slot);
        }

        self.progress = tracing::info_span!("running_pipeline");
        self.progress.pb_set_length(selected.len() as u64);
        self.progress.pb_set_style(&crate::utils::style_run());
        self.progress.pb_set_message("Running tasks...");
        let progress = self.progress.clone();
        let _enter = progress.enter();

        loop {
            while self.running.len() < self.limit {
                let Some(index) = self.ready.pop_front() else {
                    break;
                };
                self.dispatch(index);
            }

            if self.running.is_empty() {
                break;
            }

            match completions.recv() {
                Ok(completion) => self.complete(completion),
                Err(_) => break,
            }
        }

        debug_assert!(
            self.slots.values().all(|slot| slot.state.is_terminal()),
            "every selected node must end in a terminal state"
        );

        let nodes: Vec<NodeReport> = selected.iter().map(|&i| self.node_report(i)).collect();
        let status = if nodes.iter().any(|node| node.state == NodeState::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let report = RunReport {
            status,
            started_at,
            finished_at: Utc::now(),
            peak_running: self.peak_running,
            nodes,
        };

        match status {
            RunStatus::Success => tracing::info!("Run complete!"),
            RunStatus::Failed => tracing::warn!(
                failed = report.failed().count(),
                cancelled = report.cancelled().count(),
                "Run finished with failures"
            ),
        }

        report
    }

    fn dispatch(&mut self, index: NodeIndex) {
        let graph = self.graph;
        let invocation = &graph.graph[index];
        let node = invocation.id.clone();

        let slots = &self.slots;
        let lookup = |handle: &PendingResult| {
            slots
                .get(&handle.index())
                .filter(|slot| slot.state == NodeState::Succeeded)
                .and_then(|slot| slot.result.clone())
        };
        let inputs: Option<Inputs> = invocation
            .args
            .iter()
            .map(|(name, arg)| arg.resolve(&lookup).map(|value| (name.clone(), value)))
            .collect();

        let Some(inputs) = inputs else {
            // Only reachable if a node was queued before all its producers
            // succeeded.
            self.fail(
                index,
                TaskError::worker_crash(format!("Inputs of {node} are not available"), ""),
            );
            return;
        };

        let workspace = match self.workspaces.allocate(&node) {
            Ok(workspace) => workspace,
            Err(err) => {
                let message = err.to_string();
                self.fail(
                    index,
                    TaskError::new(ErrorKind::Workspace, message, format!("{err:?}")),
                );
                return;
            }
        };

        if self.link_inputs {
            link_inputs(&workspace, &inputs);
        }

        let unit = WorkUnit {
            index,
            task: invocation.task.clone(),
            payload: UnitPayload {
                node: node.clone(),
                task: invocation.task.name().to_string(),
                inputs,
                workspace: workspace.clone(),
                config: self.config.clone(),
            },
            scratch: self.scratch.clone(),
        };

        if let Some(slot) = self.slots.get_mut(&index) {
            slot.workspace = Some(workspace);
        }

        if let Err(err) = self.backend.submit(unit, self.done.clone()) {
            self.fail(
                index,
                TaskError::worker_crash(
                    format!("Couldn't dispatch {node}: {err}"),
                    format!("{err:?}"),
                ),
            );
            return;
        }

        let span = tracing::info_span!("task", node = %node);
        span.pb_set_style(&crate::utils::style_task());
        span.pb_set_message(&format!("Running {node}"));
        span.pb_start();

        if let Some(slot) = self.slots.get_mut(&index) {
            slot.state = NodeState::Running;
            slot.started_at = Some(Utc::now());
        }
        self.running.insert(index, span);
        self.peak_running = self.peak_running.max(self.running.len());
        tracing::debug!(node = %node, running = self.running.len(), "dispatched");
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            index,
            outcome,
            started_at,
            finished_at,
        } = completion;

        if self.running.remove(&index).is_none() {
            tracing::warn!(node = %self.graph.graph[index].id, "ignoring unexpected completion");
            return;
        }

        if let Some(slot) = self.slots.get_mut(&index) {
            slot.started_at = Some(started_at);
            slot.finished_at = Some(finished_at);
        }

        match outcome {
            Ok(value) => self.succeed(index, value),
            Err(error) => self.fail(index, error),
        }
    }

    fn succeed(&mut self, index: NodeIndex, value: Value) {
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.state = NodeState::Succeeded;
            slot.result = Some(value);
        }
        tracing::info!(node = %self.graph.graph[index].id, "succeeded");
        self.notify(index);

        for &dependent in self.dependents.get(&index).into_iter().flatten() {
            let Some(slot) = self.slots.get_mut(&dependent) else {
                continue;
            };
            slot.remaining = slot.remaining.saturating_sub(1);
            if slot.remaining == 0 && slot.state == NodeState::Pending {
                slot.state = NodeState::Ready;
                self.ready.push_back(dependent);
            }
        }
    }

    fn fail(&mut self, index: NodeIndex, error: TaskError) {
        tracing::warn!(node = %self.graph.graph[index].id, error = %error, "failed");

        if let Some(slot) = self.slots.get_mut(&index) {
            slot.state = NodeState::Failed;
            slot.finished_at.get_or_insert_with(Utc::now);
            slot.error = Some(error);
        }
        self.notify(index);
        self.cancel_descendants(index);
    }

    /// Cancel every transitive consumer of `origin` which has not started.
    /// A node cancelled earlier keeps its first cause.
    fn cancel_descendants(&mut self, origin: NodeIndex) {
        let cause = self.graph.graph[origin].id.clone();
        let mut queue: VecDeque<NodeIndex> =
            self.dependents.get(&origin).cloned().unwrap_or_default().into();

        while let Some(index) = queue.pop_front() {
            let Some(slot) = self.slots.get_mut(&index) else {
                continue;
            };
            if slot.state != NodeState::Pending {
                continue;
            }

            slot.state = NodeState::Cancelled;
            slot.cancelled_by = Some(origin);
            slot.finished_at = Some(Utc::now());
            slot.error = Some(cancellation(&cause));

            tracing::warn!(node = %self.graph.graph[index].id, cause = %cause, "cancelled");
            self.notify(index);

            if let Some(next) = self.dependents.get(&index) {
                queue.extend(next.iter().copied());
            }
        }
    }

    fn notify(&mut self, index: NodeIndex) {
        self.progress.pb_inc(1);
        if self.on_complete.is_some() {
            let report = self.node_report(index);
            if let Some(callback) = self.on_complete.as_mut() {
                callback(&report);
            }
        }
    }

    fn node_report(&self, index: NodeIndex) -> NodeReport {
        let graph = &self.graph.graph;
        let invocation = &graph[index];

        let mut dependencies: Vec<NodeIndex> = graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        dependencies.sort();

        let slot = self.slots.get(&index);
        NodeReport {
            id: invocation.id.clone(),
            task: invocation.task.name().to_string(),
            state: slot.map_or(NodeState::Pending, |slot| slot.state),
            dependencies: dependencies
                .into_iter()
                .map(|dep| graph[dep].id.clone())
                .collect(),
            started_at: slot.and_then(|slot| slot.started_at),
            finished_at: slot.and_then(|slot| slot.finished_at),
            workspace: slot.and_then(|slot| slot.workspace.clone()),
            result: slot.and_then(|slot| slot.result.clone()),
            error: slot.and_then(|slot| slot.error.clone()),
            cancelled_by: slot
                .and_then(|slot| slot.cancelled_by)
                .map(|cause| graph[cause].id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::backend::ThreadBackend;
    use crate::task::{Registry, Signature, TaskContext, TaskResult};
    use serde_json::json;

    fn echo(ctx: &TaskContext) -> TaskResult {
        Ok(ctx.input("x")?.clone())
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("work")).unwrap();
        (dir, root)
    }

    #[test]
    fn zero_workers_is_rejected() {
        let graph = Registry::new().pipeline().finish();
        let (_dir, root) = tempdir();

        let err = Scheduler::new(&graph, RunOptions::new(root).max_workers(0))
            .backend(ThreadBackend::new(1).unwrap())
            .run()
            .unwrap_err();
        assert!(matches!(err, RunError::InvalidWorkers));
    }

    #[test]
    fn empty_graph_succeeds() {
        let graph = Registry::new().pipeline().finish();
        let (_dir, root) = tempdir();

        let report = Scheduler::new(&graph, RunOptions::new(root))
            .backend(ThreadBackend::new(2).unwrap())
            .run()
            .unwrap();
        assert!(report.is_success());
        assert!(report.nodes.is_empty());
        assert_eq!(report.peak_running, 0);
    }

    #[test]
    fn foreign_target_is_rejected() {
        let mut registry = Registry::new();
        let t = registry.register("t", Signature::of(["x"]), echo).unwrap();

        let mut other = registry.pipeline();
        let stray = t.call(&mut other, Args::new().arg(1)).unwrap();
        let graph = registry.pipeline().finish();
        let (_dir, root) = tempdir();

        let err = Scheduler::new(&graph, RunOptions::new(root).target(&stray))
            .backend(ThreadBackend::new(1).unwrap())
            .run()
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownTarget(_)));
    }

    #[test]
    fn values_flow_through_lists() {
        let mut registry = Registry::new();
        let t = registry.register("t", Signature::of(["x"]), echo).unwrap();

        let mut p = registry.pipeline();
        let a = t.call(&mut p, Args::new().arg(1)).unwrap();
        let b = t.call(&mut p, Args::new().arg(2)).unwrap();
        let c = t.call(&mut p, Args::new().arg(vec![a, b])).unwrap();
        let graph = p.finish();
        let (_dir, root) = tempdir();

        let report = Scheduler::new(&graph, RunOptions::new(root))
            .backend(ThreadBackend::new(2).unwrap())
            .run()
            .unwrap();
        assert_eq!(report.value(&c), Some(&json!([1, 2])));
    }

    #[cfg(feature = "logging")]
    #[test]
    fn task_bars_start_under_the_indicatif_layer() {
        use tracing_indicatif::IndicatifLayer;
        use tracing_subscriber::layer::SubscriberExt;

        let mut registry = Registry::new();
        let t = registry.register("t", Signature::of(["x"]), echo).unwrap();

        let mut p = registry.pipeline();
        let a = t.call(&mut p, Args::new().arg(1)).unwrap();
        let b = t.call(&mut p, Args::new().arg(a.clone())).unwrap();
        let graph = p.finish();
        let (_dir, root) = tempdir();

        let subscriber = tracing_subscriber::registry().with(IndicatifLayer::new());
        let report = tracing::subscriber::with_default(subscriber, || {
            Scheduler::new(&graph, RunOptions::new(root))
                .backend(ThreadBackend::new(2).unwrap())
                .run()
                .unwrap()
        });

        assert!(report.is_success(), "{report}");
        assert_eq!(report.value(&b), Some(&json!(1)));
    }
}
