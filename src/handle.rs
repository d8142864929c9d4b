use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

/// Identity of one graph-build context.
///
/// Every [`GraphBuilder`](crate::GraphBuilder) gets a fresh id, which is
/// stamped into each handle it hands out. This is how the builder recognises
/// handles that were produced by some other (or already closed) graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl GraphId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        GraphId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph#{}", self.0)
    }
}

/// Stable, human readable identifier of an invocation: `<task>/<invocation>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub(crate) fn new(task: &str, invocation: &str) -> Self {
        NodeId(format!("{task}/{invocation}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The task name part of the id.
    pub fn task(&self) -> &str {
        self.0.split_once('/').map_or(&self.0, |(task, _)| task)
    }

    /// The invocation part of the id, used as the workspace directory name.
    pub fn invocation(&self) -> &str {
        self.0.split_once('/').map_or("", |(_, inv)| inv)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lightweight token representing the not-yet-materialized output of one
/// task invocation.
///
/// A `PendingResult` is returned by every task call made while building a
/// pipeline. It carries no value of its own, it only points back at the node
/// that will produce it. Passing it as an argument to a later call is what
/// creates a dependency edge. After a run, the concrete value can be looked up
/// with [`RunReport::value`](crate::RunReport::value), which only yields a
/// value when the owning node succeeded.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PendingResult {
    pub(crate) graph: GraphId,
    pub(crate) index: NodeIndex,
    pub(crate) id: NodeId,
}

impl PendingResult {
    pub(crate) fn new(graph: GraphId, index: NodeIndex, id: NodeId) -> Self {
        Self { graph, index, id }
    }

    /// Id of the node that will produce this result.
    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    /// Name of the task that will produce this result.
    pub fn task(&self) -> &str {
        self.id.task()
    }

    /// Graph this handle belongs to.
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub(crate) fn index(&self) -> NodeIndex {
        self.index
    }
}

impl fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pending {} in {}>", self.id, self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_parts() {
        let id = NodeId::new("split_file", "0123abcd99");
        assert_eq!(id.as_str(), "split_file/0123abcd99");
        assert_eq!(id.task(), "split_file");
        assert_eq!(id.invocation(), "0123abcd99");
    }

    #[test]
    fn graph_ids_are_unique() {
        let a = GraphId::next();
        let b = GraphId::next();
        assert_ne!(a, b);
    }
}
