mod common;

use std::collections::BTreeSet;

use anyhow::bail;
use common::workdir;
use pipewright::{Args, NodeState, PendingResult, Registry, RunOptions, RunStatus, Scheduler, Signature, ThreadBackend};
use proptest::prelude::*;
use serde_json::json;

/// Random DAG as dependency lists. Acyclic by construction: node `i` may only
/// depend on nodes `0..i`.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1..=max_nodes).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), n).prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, deps)| match i {
                    0 => BTreeSet::new(),
                    i => deps.into_iter().map(|d| d % i).collect(),
                })
                .collect()
        })
    })
}

/// What a correct run must produce: a node fails iff it is marked failing and
/// all its dependencies succeeded, it is cancelled iff some dependency did
/// not succeed.
fn expected_states(deps: &[BTreeSet<usize>], failing: &BTreeSet<usize>) -> Vec<NodeState> {
    let mut states = Vec::with_capacity(deps.len());
    for (i, node_deps) in deps.iter().enumerate() {
        let state = if node_deps.iter().any(|&d| states[d] != NodeState::Succeeded) {
            NodeState::Cancelled
        } else if failing.contains(&i) {
            NodeState::Failed
        } else {
            NodeState::Succeeded
        };
        states.push(state);
    }
    states
}

fn ancestors(deps: &[BTreeSet<usize>], node: usize) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<usize> = deps[node].iter().copied().collect();
    while let Some(next) = stack.pop() {
        if seen.insert(next) {
            stack.extend(deps[next].iter().copied());
        }
    }
    seen
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn scheduling_respects_the_graph(
        deps in dag_strategy(12),
        failing in proptest::collection::btree_set(0..12usize, 0..4),
        workers in 1..4usize,
    ) {
        let mut registry = Registry::new();
        let node = registry
            .register("node", Signature::of(["id", "fail", "deps"]), |ctx| {
                let id: u64 = ctx.input_as("id")?;
                if ctx.input_as::<bool>("fail")? {
                    bail!("node {id} failed");
                }
                // Every dependency must have been resolved to its producer's id.
                let _: Vec<u64> = ctx.input_as("deps")?;
                Ok(json!(id))
            })
            .unwrap();

        let mut p = registry.pipeline();
        let mut handles: Vec<PendingResult> = Vec::new();
        for (i, node_deps) in deps.iter().enumerate() {
            let inputs: Vec<PendingResult> = node_deps.iter().map(|&d| handles[d].clone()).collect();
            let handle = node
                .call(&mut p, Args::new().arg(i).arg(failing.contains(&i)).arg(inputs))
                .unwrap();
            handles.push(handle);
        }
        let graph = p.finish();
        let (_dir, root) = workdir();

        let report = Scheduler::new(&graph, RunOptions::new(root).max_workers(workers))
            .backend(ThreadBackend::new(4).unwrap())
            .run()
            .unwrap();

        let expected = expected_states(&deps, &failing);
        prop_assert_eq!(report.nodes.len(), deps.len());
        prop_assert!(report.peak_running <= workers);

        for (i, handle) in handles.iter().enumerate() {
            let actual = report.node(handle).unwrap();
            prop_assert_eq!(actual.state, expected[i], "node {}", i);

            match actual.state {
                NodeState::Succeeded => {
                    let want = json!(i);
                    prop_assert_eq!(report.value(handle), Some(&want));
                }
                NodeState::Cancelled => {
                    let cause = actual.cancelled_by.as_ref().unwrap();
                    let cause = handles.iter().position(|h| h.node_id() == cause).unwrap();
                    prop_assert_eq!(expected[cause], NodeState::Failed);
                    prop_assert!(ancestors(&deps, i).contains(&cause));
                    prop_assert!(actual.started_at.is_none());
                }
                _ => prop_assert!(report.value(handle).is_none()),
            }
        }

        let any_failed = expected.contains(&NodeState::Failed);
        prop_assert_eq!(report.status == RunStatus::Failed, any_failed);
    }
}
