// src/config/validate.rs

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{PipelineFile, RawPipelineFile, Settings, dependency_edges, normalize_path};
use crate::errors::{Result, StagehandError};

impl TryFrom<RawPipelineFile> for PipelineFile {
    type Error = StagehandError;

    fn try_from(raw: RawPipelineFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_pipeline(&raw)?;
        Ok(PipelineFile::new_unchecked(raw.stage))
    }
}

fn validate_raw_pipeline(cfg: &RawPipelineFile) -> Result<()> {
    validate_stage_names(cfg)?;
    validate_stage_dependencies(cfg)?;
    validate_unique_outputs(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn validate_stage_names(cfg: &RawPipelineFile) -> Result<()> {
    for (name, stage) in cfg.stage.iter() {
        if name.trim().is_empty() {
            return Err(StagehandError::ConfigError(
                "stage names must not be empty".to_string(),
            ));
        }
        if let Some(cmd) = &stage.cmd {
            if cmd.trim().is_empty() {
                return Err(StagehandError::ConfigError(format!(
                    "stage '{}' has an empty `cmd`; omit it for data-only stages",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_stage_dependencies(cfg: &RawPipelineFile) -> Result<()> {
    for (name, stage) in cfg.stage.iter() {
        for dep in stage.after.iter() {
            if !cfg.stage.contains_key(dep) {
                return Err(StagehandError::ConfigError(format!(
                    "stage '{}' has unknown dependency '{}' in `after`",
                    name, dep
                )));
            }
            if dep == name {
                return Err(StagehandError::ConfigError(format!(
                    "stage '{}' cannot depend on itself in `after`",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_unique_outputs(cfg: &RawPipelineFile) -> Result<()> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    for (name, stage) in cfg.stage.iter() {
        for out in stage.outs.iter() {
            let key = normalize_path(out);
            if let Some(owner) = owners.insert(key, name.as_str()) {
                return Err(StagehandError::ConfigError(format!(
                    "output '{}' is declared by both '{}' and '{}'",
                    out, owner, name
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawPipelineFile) -> Result<()> {
    // Edge direction: upstream -> downstream.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.stage.keys() {
        graph.add_node(name.as_str());
    }

    let edges = dependency_edges(&cfg.stage);
    for (from, to) in edges.iter() {
        graph.add_edge(from.as_str(), to.as_str(), ());
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(StagehandError::DagCycle(format!(
                "cycle detected in stage graph involving stage '{}'",
                node
            )))
        }
    }
}

impl Settings {
    /// Sanity checks that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.exec.retries == 0 {
            return Err(StagehandError::ConfigError(
                "[exec].retries must be >= 1 (got 0)".to_string(),
            ));
        }
        if self.exec.workers == Some(0) {
            return Err(StagehandError::ConfigError(
                "[exec].workers must be >= 1 (got 0)".to_string(),
            ));
        }
        Ok(())
    }
}
