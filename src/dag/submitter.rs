// src/dag/submitter.rs

//! Dependency-ordered submission of a stage graph to a task system.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::dag::graph::{Stage, StageGraph, StageId, StageName};
use crate::errors::Result;

/// Anything that accepts tasks together with handles to the tasks they
/// depend on, and gives back a handle for the new task.
///
/// The local worker pool implements this; tests use a recording fake.
pub trait TaskSubmitter {
    type Handle: Clone;

    fn submit(&mut self, stage: &Stage, deps: Vec<Self::Handle>) -> Self::Handle;
}

/// Result of [`submit_graph`].
#[derive(Debug)]
pub struct Submission<H> {
    /// Runnable stages in submission order, with their handles.
    pub handles: Vec<(StageName, H)>,
    /// Data-only stages that were passed through without a task.
    pub passed_through: Vec<StageName>,
}

impl<H> Submission<H> {
    pub fn order(&self) -> Vec<&str> {
        self.handles.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Submit every runnable stage of `graph` (restricted to `targets` and their
/// ancestors) exactly once, each only after all of its predecessors.
///
/// Data-only stages never become tasks: a stage downstream of one depends
/// directly on whatever runnable stages feed into it.
pub fn submit_graph<S: TaskSubmitter>(
    graph: &StageGraph,
    targets: &[String],
    submitter: &mut S,
) -> Result<Submission<S::Handle>> {
    let graph = graph.restrict_to(targets)?;
    let order = graph.topological_order()?;

    // For every processed stage: the runnable stages a dependent must wait on.
    let mut providers: HashMap<StageId, Vec<StageId>> = HashMap::with_capacity(order.len());
    let mut handles: HashMap<StageId, S::Handle> = HashMap::new();
    let mut submission = Submission {
        handles: Vec::new(),
        passed_through: Vec::new(),
    };

    for id in order {
        let mut upstream: Vec<StageId> = Vec::new();
        for pred in graph.predecessor_ids(id) {
            for provider in providers.get(pred).into_iter().flatten() {
                if !upstream.contains(provider) {
                    upstream.push(*provider);
                }
            }
        }

        let stage = graph.get(id);
        if !stage.is_runnable() {
            trace!(stage = %stage.name, "passing through data-only stage");
            submission.passed_through.push(stage.name.clone());
            providers.insert(id, upstream);
            continue;
        }

        let deps: Vec<S::Handle> = upstream
            .iter()
            .filter_map(|p| handles.get(p).cloned())
            .collect();

        debug!(stage = %stage.name, deps = deps.len(), "submitting stage");
        let handle = submitter.submit(stage, deps);
        handles.insert(id, handle.clone());
        submission.handles.push((stage.name.clone(), handle));
        providers.insert(id, vec![id]);
    }

    Ok(submission)
}
