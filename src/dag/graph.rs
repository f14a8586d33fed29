// src/dag/graph.rs

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use blake3::Hasher;

use crate::config::model::{PipelineFile, StageConfig};
use crate::errors::{Result, StagehandError};

/// Canonical stage name type.
pub type StageName = String;

/// Index of a stage inside one [`StageGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(usize);

impl StageId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a stage does when it is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// Runs a shell command.
    Runnable { cmd: String },
    /// Tracks data produced outside the pipeline; never occupies a worker.
    DataOnly,
}

/// One node of the stage DAG.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: StageName,
    pub kind: StageKind,
    pub deps: Vec<String>,
    pub outs: Vec<String>,
    pub params: BTreeMap<String, String>,
    /// blake3 over everything above; changes whenever the definition does.
    pub definition_hash: String,
}

impl Stage {
    pub fn new(
        name: impl Into<StageName>,
        kind: StageKind,
        deps: Vec<String>,
        outs: Vec<String>,
        params: BTreeMap<String, String>,
    ) -> Self {
        let name = name.into();
        let definition_hash = definition_hash(&name, &kind, &deps, &outs, &params);
        Self {
            name,
            kind,
            deps,
            outs,
            params,
            definition_hash,
        }
    }

    pub fn runnable(name: impl Into<StageName>, cmd: impl Into<String>) -> Self {
        Self::new(
            name,
            StageKind::Runnable { cmd: cmd.into() },
            Vec::new(),
            Vec::new(),
            BTreeMap::new(),
        )
    }

    pub fn data_only(name: impl Into<StageName>) -> Self {
        Self::new(
            name,
            StageKind::DataOnly,
            Vec::new(),
            Vec::new(),
            BTreeMap::new(),
        )
    }

    pub fn from_config(name: &str, cfg: &StageConfig) -> Self {
        let kind = match &cfg.cmd {
            Some(cmd) => StageKind::Runnable { cmd: cmd.clone() },
            None => StageKind::DataOnly,
        };
        Self::new(
            name.to_string(),
            kind,
            cfg.deps.clone(),
            cfg.outs.clone(),
            cfg.params.clone(),
        )
    }

    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            StageKind::Runnable { cmd } => Some(cmd.as_str()),
            StageKind::DataOnly => None,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.kind, StageKind::Runnable { .. })
    }
}

fn definition_hash(
    name: &str,
    kind: &StageKind,
    deps: &[String],
    outs: &[String],
    params: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Hasher::new();
    let mut field = |tag: &str, value: &str| {
        hasher.update(tag.as_bytes());
        hasher.update(&(value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    };

    field("name", name);
    match kind {
        StageKind::Runnable { cmd } => field("cmd", cmd),
        StageKind::DataOnly => field("data", ""),
    }

    let mut sorted_deps: Vec<&String> = deps.iter().collect();
    sorted_deps.sort();
    for dep in sorted_deps {
        field("dep", dep);
    }

    let mut sorted_outs: Vec<&String> = outs.iter().collect();
    sorted_outs.sort();
    for out in sorted_outs {
        field("out", out);
    }

    for (key, value) in params.iter() {
        field("param", key);
        field("value", value);
    }

    hasher.finalize().to_hex().to_string()
}

/// In-memory stage DAG.
///
/// Stages live in an arena indexed by [`StageId`]; adjacency is kept in both
/// directions. Insertion order is preserved and drives every traversal, so
/// results are deterministic.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    stages: Vec<Stage>,
    index: HashMap<StageName, StageId>,
    /// Direct predecessors (stages that must complete first).
    preds: Vec<Vec<StageId>>,
    /// Direct successors (stages waiting on this one).
    succs: Vec<Vec<StageId>>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a validated [`PipelineFile`].
    pub fn from_pipeline(pipeline: &PipelineFile) -> Self {
        let mut graph = Self::new();

        for (name, cfg) in pipeline.stages().iter() {
            graph.add_stage(Stage::from_config(name, cfg));
        }

        for (from, to) in pipeline.edges() {
            // Validation guarantees both endpoints exist.
            let _ = graph.add_edge(&from, &to);
        }

        graph
    }

    /// Insert a stage, or replace the definition of an existing stage with
    /// the same name while keeping its position and edges.
    pub fn add_stage(&mut self, stage: Stage) -> StageId {
        if let Some(&id) = self.index.get(&stage.name) {
            self.stages[id.0] = stage;
            return id;
        }

        let id = StageId(self.stages.len());
        self.index.insert(stage.name.clone(), id);
        self.stages.push(stage);
        self.preds.push(Vec::new());
        self.succs.push(Vec::new());
        id
    }

    /// Add an `upstream -> downstream` edge. Duplicate edges are ignored.
    pub fn add_edge(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        let from = self.require(upstream)?;
        let to = self.require(downstream)?;

        if !self.succs[from.0].contains(&to) {
            self.succs[from.0].push(to);
            self.preds[to.0].push(from);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn id_of(&self, name: &str) -> Option<StageId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: StageId) -> &Stage {
        &self.stages[id.0]
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.id_of(name).map(|id| self.get(id))
    }

    /// All stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn predecessor_ids(&self, id: StageId) -> &[StageId] {
        &self.preds[id.0]
    }

    /// Names of the direct predecessors of `name`.
    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        self.id_of(name)
            .map(|id| self.names(self.predecessor_ids(id)))
            .unwrap_or_default()
    }

    /// Stages without predecessors, in insertion order.
    pub fn starting_nodes(&self) -> Vec<&str> {
        (0..self.stages.len())
            .filter(|&i| self.preds[i].is_empty())
            .map(|i| self.stages[i].name.as_str())
            .collect()
    }

    /// A valid processing order: every stage appears after all of its
    /// predecessors.
    ///
    /// Kahn's algorithm over an explicit worklist: starting nodes are queued
    /// first, and a successor is queued once every one of its predecessors
    /// has been emitted.
    pub fn topological_order(&self) -> Result<Vec<StageId>> {
        let mut remaining: Vec<usize> = self.preds.iter().map(Vec::len).collect();
        let mut worklist: VecDeque<StageId> = (0..self.stages.len())
            .filter(|&i| remaining[i] == 0)
            .map(StageId)
            .collect();
        let mut visited: HashSet<StageId> = HashSet::with_capacity(self.stages.len());
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(id) = worklist.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            order.push(id);

            for &next in self.succs[id.0].iter() {
                remaining[next.0] -= 1;
                if remaining[next.0] == 0 {
                    worklist.push_back(next);
                }
            }
        }

        if order.len() != self.stages.len() {
            let stuck = (0..self.stages.len())
                .map(StageId)
                .find(|id| !visited.contains(id))
                .map(|id| self.get(id).name.clone())
                .unwrap_or_default();
            return Err(StagehandError::DagCycle(format!(
                "cycle detected in stage graph involving stage '{}'",
                stuck
            )));
        }

        Ok(order)
    }

    /// `(stage, predecessors)` pairs in processing order.
    ///
    /// Starting nodes carry `None`; every other stage carries the names of
    /// its direct predecessors, all of which appear earlier in the list.
    pub fn iterate_over_nodes(&self) -> Result<Vec<(StageName, Option<Vec<StageName>>)>> {
        let order = self.topological_order()?;
        Ok(order
            .into_iter()
            .map(|id| {
                let preds = self.predecessor_ids(id);
                let name = self.get(id).name.clone();
                if preds.is_empty() {
                    (name, None)
                } else {
                    let names = preds.iter().map(|p| self.get(*p).name.clone()).collect();
                    (name, Some(names))
                }
            })
            .collect())
    }

    /// Sub-graph containing `targets` and everything upstream of them.
    ///
    /// An empty target list keeps the whole graph.
    pub fn restrict_to(&self, targets: &[String]) -> Result<StageGraph> {
        if targets.is_empty() {
            return Ok(self.clone());
        }

        let mut keep: HashSet<StageId> = HashSet::new();
        let mut worklist: Vec<StageId> = Vec::new();
        for target in targets {
            worklist.push(self.require(target)?);
        }

        while let Some(id) = worklist.pop() {
            if keep.insert(id) {
                worklist.extend(self.predecessor_ids(id).iter().copied());
            }
        }

        let mut restricted = StageGraph::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if keep.contains(&StageId(i)) {
                restricted.add_stage(stage.clone());
            }
        }
        for (i, succs) in self.succs.iter().enumerate() {
            if !keep.contains(&StageId(i)) {
                continue;
            }
            for next in succs.iter().filter(|s| keep.contains(s)) {
                restricted.add_edge(&self.stages[i].name, &self.get(*next).name)?;
            }
        }

        Ok(restricted)
    }

    fn require(&self, name: &str) -> Result<StageId> {
        self.id_of(name)
            .ok_or_else(|| StagehandError::StageNotFound(name.to_string()))
    }

    fn names(&self, ids: &[StageId]) -> Vec<&str> {
        ids.iter().map(|id| self.get(*id).name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> StageGraph {
        let mut g = StageGraph::new();
        for n in nodes {
            g.add_stage(Stage::runnable(*n, format!("echo {n}")));
        }
        for (a, b) in edges {
            g.add_edge(a, b).unwrap();
        }
        g
    }

    fn names(v: &[(StageName, Option<Vec<StageName>>)]) -> Vec<&str> {
        v.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn fan_out_yields_root_then_children() {
        let g = graph(&["N1", "N2", "N3"], &[("N1", "N2"), ("N1", "N3")]);
        assert_eq!(g.starting_nodes(), vec!["N1"]);
        assert_eq!(
            g.iterate_over_nodes().unwrap(),
            vec![
                ("N1".to_string(), None),
                ("N2".to_string(), Some(vec!["N1".to_string()])),
                ("N3".to_string(), Some(vec!["N1".to_string()])),
            ]
        );
    }

    #[test]
    fn isolated_node_is_a_starting_node() {
        let g = graph(&["N1", "N2", "N3", "N4"], &[("N1", "N2"), ("N1", "N3")]);
        assert_eq!(g.starting_nodes(), vec!["N1", "N4"]);
        assert_eq!(
            names(&g.iterate_over_nodes().unwrap()),
            vec!["N1", "N4", "N2", "N3"]
        );
    }

    #[test]
    fn diamond_waits_for_both_branches() {
        let g = graph(
            &["A", "B", "C", "D"],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        );
        let order = g.iterate_over_nodes().unwrap();
        assert_eq!(names(&order), vec!["A", "B", "C", "D"]);
        assert_eq!(
            order[3].1,
            Some(vec!["B".to_string(), "C".to_string()])
        );
    }

    #[test]
    fn restrict_keeps_only_upstream_closure() {
        let g = graph(
            &["A", "B", "C", "D"],
            &[("A", "B"), ("B", "C"), ("A", "D")],
        );
        let sub = g.restrict_to(&["C".to_string()]).unwrap();
        let kept: Vec<&str> = sub.stages().map(|s| s.name.as_str()).collect();
        assert_eq!(kept, vec!["A", "B", "C"]);
        assert_eq!(sub.predecessors("C"), vec!["B"]);
    }

    #[test]
    fn restrict_to_unknown_target_is_stage_not_found() {
        let g = graph(&["A"], &[]);
        let err = g.restrict_to(&["missing".to_string()]).unwrap_err();
        assert!(matches!(err, StagehandError::StageNotFound(name) if name == "missing"));
    }

    #[test]
    fn cycle_is_reported() {
        let g = graph(&["A", "B"], &[("A", "B"), ("B", "A")]);
        assert!(matches!(
            g.topological_order(),
            Err(StagehandError::DagCycle(_))
        ));
    }

    #[test]
    fn definition_hash_tracks_command_changes() {
        let a = Stage::runnable("train", "python train.py");
        let b = Stage::runnable("train", "python train.py --epochs 2");
        assert_ne!(a.definition_hash, b.definition_hash);
        assert_eq!(
            a.definition_hash,
            Stage::runnable("train", "python train.py").definition_hash
        );
    }
}
