#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use stagehand::config::{PIPELINE_FILE, PipelineFile, RawPipelineFile, StageConfig};
use stagehand::dag::{Stage, StageGraph};
use stagehand::store::Repository;
use tempfile::TempDir;

/// Builder for `pipeline.toml` manifests.
pub struct PipelineBuilder {
    stages: BTreeMap<String, StageConfig>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: BTreeMap::new(),
        }
    }

    pub fn with_stage(mut self, name: &str, stage: StageConfig) -> Self {
        self.stages.insert(name.to_string(), stage);
        self
    }

    /// Validated manifest, panicking on invalid input.
    pub fn build(self) -> PipelineFile {
        PipelineFile::try_from(RawPipelineFile {
            stage: self.stages,
        })
        .expect("Failed to build valid pipeline from builder")
    }

    pub fn to_toml(&self) -> String {
        let mut doc = BTreeMap::new();
        doc.insert("stage", &self.stages);
        toml::to_string(&doc).expect("pipeline serializes to TOML")
    }

    /// Write `pipeline.toml` into `dir`.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join(PIPELINE_FILE);
        fs::write(&path, self.to_toml()).expect("write pipeline.toml");
        path
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `StageConfig`.
pub struct StageBuilder {
    stage: StageConfig,
}

impl StageBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            stage: StageConfig {
                cmd: Some(cmd.to_string()),
                ..Default::default()
            },
        }
    }

    /// A stage without a command.
    pub fn data() -> Self {
        Self {
            stage: StageConfig::default(),
        }
    }

    pub fn dep(mut self, path: &str) -> Self {
        self.stage.deps.push(path.to_string());
        self
    }

    pub fn out(mut self, path: &str) -> Self {
        self.stage.outs.push(path.to_string());
        self
    }

    pub fn after(mut self, stage: &str) -> Self {
        self.stage.after.push(stage.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.stage.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> StageConfig {
        self.stage
    }
}

/// In-memory graph from node names (all runnable) and edges.
pub fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> StageGraph {
    let mut g = StageGraph::new();
    for n in nodes {
        g.add_stage(Stage::runnable(*n, format!("echo {n}")));
    }
    for (a, b) in edges {
        g.add_edge(a, b).expect("edge endpoints exist");
    }
    g
}

/// A throw-away initialised workspace.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        Repository::init(dir.path()).expect("init repository");
        Self { dir }
    }

    pub fn with_pipeline(pipeline: PipelineBuilder) -> Self {
        let ws = Self::new();
        pipeline.write_to(ws.path());
        ws
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo(&self) -> Repository {
        Repository::open(self.path()).expect("open repository")
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).expect("read file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }

    /// Entries currently under `.stagehand/tmp/`.
    pub fn isolated_workspaces(&self) -> Vec<PathBuf> {
        let tmp = self.path().join(".stagehand").join("tmp");
        match fs::read_dir(&tmp) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
