// src/store/records.rs

//! Committed stage state: `stages.lock` and the records shared with the run
//! cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StagehandError};
use crate::store::atomic_write;
use crate::store::hash::PathSnapshot;

pub const STAGES_LOCK_FILE: &str = "stages.lock";

/// What a stage looked like when it was last committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub definition_hash: String,
    /// Dependency path -> content hash.
    #[serde(default)]
    pub deps: BTreeMap<String, String>,
    /// Output path -> snapshot.
    #[serde(default)]
    pub outs: BTreeMap<String, PathSnapshot>,
}

/// `.stagehand/stages.lock`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagesLock {
    #[serde(default)]
    pub stage: BTreeMap<String, StageRecord>,
}

impl StagesLock {
    /// Read the lock file; a missing file is an empty lock.
    ///
    /// Unparsable content is reported as `MetadataInvalid`, which the locked
    /// retry loop treats as transient.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| {
            StagehandError::MetadataInvalid(format!("{}: {}", path.display(), e))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(self)?;
        atomic_write(path, text.as_bytes())
    }

    pub fn get(&self, stage: &str) -> Option<&StageRecord> {
        self.stage.get(stage)
    }
}

/// Run-cache key: blake3 over the definition hash and the sorted
/// `(dependency path, content hash)` pairs.
pub fn run_key(definition_hash: &str, deps: &BTreeMap<String, String>) -> String {
    let mut hasher = Hasher::new();
    hasher.update(definition_hash.as_bytes());
    for (path, hash) in deps.iter() {
        hasher.update(&[0]);
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(hash.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
