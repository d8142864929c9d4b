//! Building the invocation graph.
//!
//! Pipeline code calls task handles against an open [`GraphBuilder`]. Each
//! call becomes one [`Invocation`] node, and an edge is added from every node
//! whose [`PendingResult`] appears in the call's arguments. Because a call can
//! only mention handles of nodes which already exist, every edge points from
//! an older node to a newer one and the graph is acyclic by construction.
//!
//! Closing the builder with [`GraphBuilder::finish`] yields a frozen
//! [`Graph`], which is what the scheduler runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::args::{Arg, Args};
use crate::error::{GraphConstructionError, RunError};
use crate::handle::{GraphId, NodeId, PendingResult};
use crate::report::RunReport;
use crate::scheduler::{RunOptions, Scheduler};
use crate::task::{RegistryId, TaskDef, TaskHandle};

/// One recorded call of a task.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub(crate) id: NodeId,
    pub(crate) task: Arc<TaskDef>,
    /// Arguments bound to parameter names, still holding unresolved handles.
    pub(crate) args: Vec<(String, Arg)>,
}

impl Invocation {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn task(&self) -> &str {
        self.task.name()
    }

    pub fn args(&self) -> impl Iterator<Item = (&str, &Arg)> {
        self.args.iter().map(|(name, arg)| (name.as_str(), arg))
    }
}

/// An open graph-build context.
///
/// Obtained from [`Registry::pipeline`](crate::Registry::pipeline). All task
/// calls of one pipeline go through the same builder; handles it returns are
/// only accepted by this builder.
#[derive(Debug)]
pub struct GraphBuilder {
    id: GraphId,
    registry: RegistryId,
    graph: DiGraph<Invocation, ()>,
    /// How many times each fingerprint has been seen, to number repeats.
    seen: HashMap<String, usize>,
}

impl GraphBuilder {
    pub(crate) fn new(registry: RegistryId) -> Self {
        let id = GraphId::next();
        tracing::debug!(graph = %id, "opened graph-build context");

        Self {
            id,
            registry,
            graph: DiGraph::new(),
            seen: HashMap::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Record a call of `task` with `args` and return the handle of its
    /// future result. Nothing is executed.
    pub fn call(
        &mut self,
        task: &TaskHandle,
        args: Args,
    ) -> Result<PendingResult, GraphConstructionError> {
        if task.registry != self.registry {
            return Err(GraphConstructionError::ForeignTask(task.name().to_string()));
        }

        let bound = task.def.signature.bind(task.name(), args)?;

        // Validate provenance of every handle before touching the graph, so a
        // rejected call leaves no trace.
        let mut producers = Vec::new();
        let mut foreign = None;
        for (_, arg) in &bound {
            arg.for_each_handle(&mut |handle| {
                if handle.graph != self.id {
                    foreign.get_or_insert_with(|| handle.clone());
                } else if !producers.contains(&handle.index()) {
                    producers.push(handle.index());
                }
            });
        }
        if let Some(handle) = foreign {
            return Err(GraphConstructionError::ForeignHandle {
                node: handle.id,
                expected: self.id,
                found: handle.graph,
            });
        }

        let id = self.invocation_id(task.name(), &bound);
        let index = self.graph.add_node(Invocation {
            id: id.clone(),
            task: task.def.clone(),
            args: bound,
        });

        for producer in producers {
            debug_assert!(producer < index, "edges must point from older to newer nodes");
            self.graph.add_edge(producer, index, ());
        }

        tracing::debug!(node = %id, "recorded invocation");
        Ok(PendingResult::new(self.id, index, id))
    }

    /// Close the build context.
    pub fn finish(self) -> Graph {
        debug_assert!(
            petgraph::algo::toposort(&self.graph, None).is_ok(),
            "invocation graph must be acyclic"
        );
        tracing::debug!(graph = %self.id, nodes = self.graph.node_count(), "closed graph-build context");

        Graph {
            id: self.id,
            graph: self.graph,
        }
    }

    /// Content hash of the call, numbered when the same call repeats.
    fn invocation_id(&mut self, task: &str, bound: &[(String, Arg)]) -> NodeId {
        let fingerprint: serde_json::Map<_, _> = bound
            .iter()
            .map(|(name, arg)| (name.clone(), arg.fingerprint()))
            .collect();
        let canonical = serde_json::Value::Object(fingerprint).to_string();

        let hash = blake3::Hasher::new()
            .update(task.as_bytes())
            .update(b":")
            .update(canonical.as_bytes())
            .finalize();
        let hash = hash.to_hex();
        let hash = &hash.as_str()[..10];

        let count = self.seen.entry(format!("{task}/{hash}")).or_insert(0);
        let invocation = match *count {
            0 => hash.to_string(),
            n => format!("{hash}-{n}"),
        };
        *count += 1;

        NodeId::new(task, &invocation)
    }
}

/// A closed, immutable invocation graph.
#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    pub(crate) graph: DiGraph<Invocation, ()>,
}

impl Graph {
    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All invocations in the order they were recorded.
    pub fn invocations(&self) -> impl Iterator<Item = &Invocation> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    /// The invocation owning `handle`, if the handle belongs to this graph.
    pub fn node(&self, handle: &PendingResult) -> Option<&Invocation> {
        self.owns(handle).then(|| &self.graph[handle.index()])
    }

    /// Ids of the direct dependencies of `handle`'s node.
    pub fn dependencies(&self, handle: &PendingResult) -> Vec<&NodeId> {
        self.neighbors(handle, Direction::Incoming)
    }

    /// Ids of the nodes consuming `handle` directly.
    pub fn dependents(&self, handle: &PendingResult) -> Vec<&NodeId> {
        self.neighbors(handle, Direction::Outgoing)
    }

    pub(crate) fn owns(&self, handle: &PendingResult) -> bool {
        handle.graph == self.id && handle.index().index() < self.graph.node_count()
    }

    fn neighbors(&self, handle: &PendingResult, direction: Direction) -> Vec<&NodeId> {
        if !self.owns(handle) {
            return Vec::new();
        }
        let mut ids: Vec<_> = self
            .graph
            .neighbors_directed(handle.index(), direction)
            .collect();
        ids.sort();
        ids.into_iter().map(|index| &self.graph[index].id).collect()
    }

    /// Nodes needed to produce `targets`: the targets and all their ancestors.
    pub(crate) fn ancestors_of(&self, targets: &[NodeIndex]) -> HashSet<NodeIndex> {
        let reversed = petgraph::visit::Reversed(&self.graph);
        let mut needed = HashSet::new();

        for &target in targets {
            let mut dfs = petgraph::visit::Dfs::new(reversed, target);
            while let Some(index) = dfs.next(reversed) {
                needed.insert(index);
            }
        }

        needed
    }

    /// Execute the graph with default backend and callbacks.
    pub fn run(&self, options: RunOptions) -> Result<RunReport, RunError> {
        Scheduler::new(self, options).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Registry, Signature, TaskResult};
    use serde_json::Value;

    fn noop(_: &crate::TaskContext) -> TaskResult {
        Ok(Value::Null)
    }

    fn registry() -> (Registry, TaskHandle, TaskHandle) {
        let mut registry = Registry::new();
        let source = registry.register("source", Signature::of(["name"]), noop).unwrap();
        let merge = registry.register("merge", Signature::of(["inputs"]), noop).unwrap();
        (registry, source, merge)
    }

    #[test]
    fn edges_follow_handles() {
        let (registry, source, merge) = registry();
        let mut p = registry.pipeline();

        let a = source.call(&mut p, Args::new().arg("a")).unwrap();
        let b = source.call(&mut p, Args::new().arg("b")).unwrap();
        let m = merge.call(&mut p, Args::new().arg(vec![a.clone(), b.clone(), a.clone()])).unwrap();

        let graph = p.finish();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies(&m), vec![a.node_id(), b.node_id()]);
        assert_eq!(graph.dependents(&a), vec![m.node_id()]);
        assert!(graph.dependencies(&a).is_empty());
    }

    #[test]
    fn repeated_calls_get_distinct_ids() {
        let (registry, source, _) = registry();
        let mut p = registry.pipeline();

        let first = source.call(&mut p, Args::new().arg("same")).unwrap();
        let second = source.call(&mut p, Args::new().arg("same")).unwrap();
        let other = source.call(&mut p, Args::new().arg("other")).unwrap();

        assert_ne!(first.node_id(), second.node_id());
        assert_eq!(
            second.node_id().invocation(),
            format!("{}-1", first.node_id().invocation())
        );
        assert_ne!(first.node_id().invocation(), other.node_id().invocation());
        assert_eq!(first.node_id().invocation().len(), 10);
    }

    #[test]
    fn ids_are_deterministic_across_graphs() {
        let (registry, source, merge) = registry();

        let build = || {
            let mut p = registry.pipeline();
            let a = source.call(&mut p, Args::new().arg("a")).unwrap();
            merge.call(&mut p, Args::new().arg(a)).unwrap().node_id().clone()
        };

        assert_eq!(build(), build());
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let (registry, source, merge) = registry();

        let mut closed = registry.pipeline();
        let stale = source.call(&mut closed, Args::new().arg("a")).unwrap();
        let _ = closed.finish();

        let mut p = registry.pipeline();
        let err = merge.call(&mut p, Args::new().arg(vec![stale])).unwrap_err();
        assert!(matches!(err, GraphConstructionError::ForeignHandle { .. }));
        assert!(p.is_empty(), "rejected call must not add a node");
    }

    #[test]
    fn foreign_tasks_are_rejected() {
        let (registry, _, _) = registry();
        let mut other = Registry::new();
        let alien = other.register("alien", Signature::new(), noop).unwrap();

        let mut p = registry.pipeline();
        let err = p.call(&alien, Args::new()).unwrap_err();
        assert_eq!(err, GraphConstructionError::ForeignTask("alien".into()));
    }

    #[test]
    fn ancestors_of_target() {
        let (registry, source, merge) = registry();
        let mut p = registry.pipeline();

        let a = source.call(&mut p, Args::new().arg("a")).unwrap();
        let b = source.call(&mut p, Args::new().arg("b")).unwrap();
        let m = merge.call(&mut p, Args::new().arg(a.clone())).unwrap();
        let graph = p.finish();

        let needed = graph.ancestors_of(&[m.index()]);
        assert!(needed.contains(&a.index()));
        assert!(needed.contains(&m.index()));
        assert!(!needed.contains(&b.index()));
    }
}
