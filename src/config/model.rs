// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{ClonerKind, FailurePolicy, IsolationMode, QueueMode};

/// Pipeline manifest exactly as read from `pipeline.toml`, before validation.
///
/// ```toml
/// [stage.raw]
/// outs = ["data/raw.csv"]
///
/// [stage.clean]
/// cmd = "python clean.py"
/// deps = ["clean.py", "data/raw.csv"]
/// outs = ["data/clean.csv"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPipelineFile {
    /// All stages from `[stage.<name>]`.
    #[serde(default)]
    pub stage: BTreeMap<String, StageConfig>,
}

/// Validated pipeline manifest.
///
/// Only obtainable through `TryFrom<RawPipelineFile>`, so holders can rely on
/// the dependency edges forming a DAG over known stages.
#[derive(Debug, Clone)]
pub struct PipelineFile {
    stage: BTreeMap<String, StageConfig>,
}

impl PipelineFile {
    pub(crate) fn new_unchecked(stage: BTreeMap<String, StageConfig>) -> Self {
        Self { stage }
    }

    pub fn stages(&self) -> &BTreeMap<String, StageConfig> {
        &self.stage
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stage.get(name)
    }

    /// All `upstream -> downstream` edges, explicit and implied.
    pub fn edges(&self) -> Vec<(String, String)> {
        dependency_edges(&self.stage)
    }
}

/// `[stage.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StageConfig {
    /// Shell command. A stage without one is a data-only node: it tracks
    /// outputs that something outside the pipeline produces.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Files or directories the command reads.
    #[serde(default)]
    pub deps: Vec<String>,

    /// Files or directories the command writes.
    #[serde(default)]
    pub outs: Vec<String>,

    /// Explicit ordering: this stage waits for every stage listed here.
    #[serde(default)]
    pub after: Vec<String>,

    /// Parameters exported to the command as `STAGEHAND_PARAM_<KEY>`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Normalize a manifest path so `./data/x` and `data/x` compare equal.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_start_matches("./").trim_end_matches('/');
    trimmed.to_string()
}

fn produces(out: &str, dep: &str) -> bool {
    let out = normalize_path(out);
    let dep = normalize_path(dep);
    dep == out || dep.starts_with(&format!("{out}/"))
}

/// Compute `upstream -> downstream` edges for a set of stages.
///
/// An edge `A -> B` exists when `B` lists `A` in `after`, or when one of
/// `B`'s deps is (or lies inside) one of `A`'s outs. Edges to unknown stages
/// are kept so that validation can report them.
pub fn dependency_edges(stages: &BTreeMap<String, StageConfig>) -> Vec<(String, String)> {
    let mut edges = Vec::new();

    for (name, stage) in stages.iter() {
        for dep in stage.after.iter() {
            edges.push((dep.clone(), name.clone()));
        }

        for (other, producer) in stages.iter() {
            if other == name {
                continue;
            }
            let implied = producer
                .outs
                .iter()
                .any(|out| stage.deps.iter().any(|dep| produces(out, dep)));
            if implied && !stage.after.contains(other) {
                edges.push((other.clone(), name.clone()));
            }
        }
    }

    edges
}

/// Repository settings from `.stagehand/config.toml`.
///
/// Every section and field is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub core: CoreSection,

    #[serde(default)]
    pub exec: ExecSection,

    #[serde(default)]
    pub queue: QueueSection,
}

/// `[core]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CoreSection {
    /// Cache directory override. Isolated workspaces point this at the
    /// cache of the workspace they were cloned from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

/// `[exec]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecSection {
    /// Locked-retry budget.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Upper bound of the uniform jitter between lock polls.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Worker slots. `None` means available parallelism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub isolation: IsolationMode,

    /// Remove isolated workspaces after use.
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Reproduce once more in the primary workspace after a fully
    /// successful per-stage run.
    #[serde(default = "default_true")]
    pub consolidate: bool,
}

impl Default for ExecSection {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            max_jitter_ms: default_max_jitter_ms(),
            workers: None,
            failure_policy: FailurePolicy::default(),
            isolation: IsolationMode::default(),
            cleanup: true,
            consolidate: true,
        }
    }
}

/// `[queue]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSection {
    #[serde(default)]
    pub mode: QueueMode,

    #[serde(default)]
    pub cloner: ClonerKind,

    /// Move failed experiments to `queue/rejected/` instead of leaving them
    /// queued.
    #[serde(default)]
    pub reject_failed: bool,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            cloner: ClonerKind::default(),
            reject_failed: false,
        }
    }
}

fn default_retries() -> u32 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(cmd: Option<&str>, deps: &[&str], outs: &[&str]) -> StageConfig {
        StageConfig {
            cmd: cmd.map(str::to_string),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            outs: outs.iter().map(|s| s.to_string()).collect(),
            ..StageConfig::default()
        }
    }

    #[test]
    fn outs_feeding_deps_imply_edges() {
        let mut stages = BTreeMap::new();
        stages.insert("raw".to_string(), stage(None, &[], &["data/"]));
        stages.insert(
            "clean".to_string(),
            stage(Some("clean"), &["./data/raw.csv"], &["clean.csv"]),
        );
        stages.insert("report".to_string(), stage(Some("report"), &["clean.csv"], &[]));

        let mut edges = dependency_edges(&stages);
        edges.sort();
        assert_eq!(
            edges,
            vec![
                ("clean".to_string(), "report".to_string()),
                ("raw".to_string(), "clean".to_string()),
            ]
        );
    }

    #[test]
    fn explicit_after_is_not_duplicated_by_implied_edge() {
        let mut stages = BTreeMap::new();
        stages.insert("a".to_string(), stage(Some("a"), &[], &["a.out"]));
        let mut b = stage(Some("b"), &["a.out"], &[]);
        b.after.push("a".to_string());
        stages.insert("b".to_string(), b);

        assert_eq!(
            dependency_edges(&stages),
            vec![("a".to_string(), "b".to_string())]
        );
    }

    #[test]
    fn settings_default_when_sections_missing() {
        let settings: Settings = toml::from_str("[exec]\nretries = 10\n").unwrap();
        assert_eq!(settings.exec.retries, 10);
        assert_eq!(settings.exec.max_jitter_ms, 1000);
        assert!(settings.exec.cleanup);
        assert_eq!(settings.exec.failure_policy, FailurePolicy::CollectAll);
        assert_eq!(settings.queue.mode, QueueMode::Parallel);
        assert!(settings.core.cache_dir.is_none());
    }

    #[test]
    fn settings_write_back_canonical_enum_names() {
        let mut settings = Settings::default();
        settings.exec.isolation = IsolationMode::PerStage;
        settings.exec.failure_policy = FailurePolicy::FailFast;

        let text = toml::to_string(&settings).unwrap();
        assert!(text.contains("isolation = \"per-stage\""));
        assert!(text.contains("failure_policy = \"fail-fast\""));

        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.exec.isolation, IsolationMode::PerStage);
    }
}
