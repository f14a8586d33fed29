// src/queue/history.rs

//! Collected experiments under `.stagehand/experiments/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::META_DIR;
use crate::errors::{Result, StagehandError};
use crate::store::{RepoLock, Repository, StageRecord, StagesLock, atomic_write};

/// One collected experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub name: String,
    pub revision: String,
    /// Milliseconds since the Unix epoch.
    pub collected_at: u64,
    /// Stage -> outcome (`executed`, `skipped`, `cache-hit`).
    #[serde(default)]
    pub outcomes: BTreeMap<String, String>,
    /// Committed stage state of the experiment workspace.
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

#[derive(Debug, Clone)]
pub struct ExperimentHistory {
    dir: PathBuf,
}

impl ExperimentHistory {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(META_DIR).join("experiments"),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }

    pub fn record(&self, record: &ExperimentRecord) -> Result<()> {
        atomic_write(&self.path(&record.name), toml::to_string(record)?.as_bytes())?;
        info!(name = %record.name, stages = record.stages.len(), "recorded experiment");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ExperimentRecord> {
        let path = self.path(name);
        if !path.is_file() {
            return Err(StagehandError::ExperimentNotFound(name.to_string()));
        }
        let text = fs::read_to_string(&path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Collected experiments ordered by collection time.
    pub fn list(&self) -> Result<Vec<ExperimentRecord>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let path = item?.path();
            let is_record = path.extension().is_some_and(|e| e == "toml")
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if is_record {
                let text = fs::read_to_string(&path)?;
                records.push(toml::from_str::<ExperimentRecord>(&text)?);
            }
        }
        records.sort_by(|a, b| {
            a.collected_at
                .cmp(&b.collected_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    /// Check the outputs of experiment `name` out of the cache into `repo`
    /// and record them as its committed state. Returns the applied stages.
    ///
    /// Fails with `LockContention` if the repository lock is held.
    pub fn apply(&self, repo: &Repository, name: &str) -> Result<Vec<String>> {
        let record = self.get(name)?;
        let _guard = RepoLock::acquire(repo.meta_dir())?;

        for (stage, stage_record) in record.stages.iter() {
            repo.checkout(stage, stage_record)?;
        }

        let path = repo.stages_lock_path();
        let mut lock = StagesLock::load(&path)?;
        for (stage, stage_record) in record.stages.iter() {
            lock.stage.insert(stage.clone(), stage_record.clone());
        }
        lock.save(&path)?;

        info!(name, stages = record.stages.len(), "applied experiment");
        Ok(record.stages.keys().cloned().collect())
    }
}
