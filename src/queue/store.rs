// src/queue/store.rs

//! Durable experiment queue under `.stagehand/queue/`.
//!
//! ```text
//! queue/entries/<name>.toml        pending entries
//! queue/info/<name>.toml           how to run each entry
//! queue/rejected/<name>.toml       rejected entries
//! queue/rejected/<name>.info.toml  and their info files
//! ```
//!
//! Writing the entry file is the commit point of `enqueue`; removing or
//! renaming it is the commit point of `remove` / `reject`, so a collected or
//! rejected entry is never picked up again.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::META_DIR;
use crate::errors::{Result, StagehandError};
use crate::store::atomic_write;
use crate::types::ClonerKind;

/// A pending experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    /// Content revision the experiment runs against.
    pub revision: String,
    /// Info file, relative to the workspace root.
    pub infofile: PathBuf,
    /// Milliseconds since the Unix epoch.
    pub queued_at: u64,
}

/// How to materialize and execute one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub name: String,
    pub revision: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub cloner: ClonerKind,
}

#[derive(Debug, Clone)]
pub struct ExperimentQueue {
    root: PathBuf,
    dir: PathBuf,
}

impl ExperimentQueue {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            dir: root.join(META_DIR).join("queue"),
        }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join("entries").join(format!("{name}.toml"))
    }

    fn info_rel(&self, name: &str) -> PathBuf {
        PathBuf::from(META_DIR)
            .join("queue")
            .join("info")
            .join(format!("{name}.toml"))
    }

    fn rejected_dir(&self) -> PathBuf {
        self.dir.join("rejected")
    }

    /// Append `info` to the queue.
    pub fn enqueue(&self, info: &ExperimentInfo) -> Result<QueueEntry> {
        validate_name(&info.name)?;
        if self.entry_path(&info.name).exists() {
            return Err(StagehandError::ConfigError(format!(
                "experiment '{}' is already queued",
                info.name
            )));
        }

        let infofile = self.info_rel(&info.name);
        atomic_write(&self.root.join(&infofile), toml::to_string(info)?.as_bytes())?;

        let entry = QueueEntry {
            name: info.name.clone(),
            revision: info.revision.clone(),
            infofile,
            queued_at: now_millis(),
        };
        atomic_write(
            &self.entry_path(&entry.name),
            toml::to_string(&entry)?.as_bytes(),
        )?;

        info!(name = %entry.name, revision = %entry.revision, "queued experiment");
        Ok(entry)
    }

    /// Pending entries, oldest first.
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = read_entries(&self.dir.join("entries"))?;
        entries.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub fn rejected(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = read_entries(&self.rejected_dir())?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn get(&self, name: &str) -> Result<QueueEntry> {
        let path = self.entry_path(name);
        if !path.is_file() {
            return Err(StagehandError::ExperimentNotFound(name.to_string()));
        }
        read_entry(&path)
    }

    pub fn info(&self, entry: &QueueEntry) -> Result<ExperimentInfo> {
        let text = fs::read_to_string(self.root.join(&entry.infofile))?;
        Ok(toml::from_str(&text)?)
    }

    /// Drop an entry and its info file.
    pub fn remove(&self, name: &str) -> Result<QueueEntry> {
        let entry = self.get(name)?;
        fs::remove_file(self.entry_path(name))?;
        let info = self.root.join(&entry.infofile);
        if info.exists() {
            fs::remove_file(&info)?;
        }
        debug!(name, "removed queue entry");
        Ok(entry)
    }

    /// Move an entry (and its info file) to `queue/rejected/`.
    pub fn reject(&self, name: &str) -> Result<QueueEntry> {
        let entry = self.get(name)?;
        let rejected = self.rejected_dir();
        fs::create_dir_all(&rejected)?;

        fs::rename(self.entry_path(name), rejected.join(format!("{name}.toml")))?;
        let info = self.root.join(&entry.infofile);
        if info.exists() {
            fs::rename(&info, rejected.join(format!("{name}.info.toml")))?;
        }
        info!(name, "rejected experiment");
        Ok(entry)
    }

    /// Whether any pending or rejected entry other than `except` uses
    /// `revision`. Rejected entries keep theirs for investigation.
    pub fn revision_in_use(&self, revision: &str, except: &str) -> Result<bool> {
        let pending = self.list()?;
        let rejected = self.rejected()?;
        Ok(pending
            .iter()
            .chain(rejected.iter())
            .any(|e| e.revision == revision && e.name != except))
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StagehandError::ConfigError(format!(
            "invalid experiment name '{name}' (use letters, digits, '-', '_' and '.')"
        )))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn read_entry(path: &Path) -> Result<QueueEntry> {
    let text = fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| {
        StagehandError::MetadataInvalid(format!("queue entry {}: {}", path.display(), e))
    })
}

fn read_entries(dir: &Path) -> Result<Vec<QueueEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for item in fs::read_dir(dir)? {
        let path = item?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let Some(name) = name else { continue };
        if name.starts_with('.') || !name.ends_with(".toml") || name.ends_with(".info.toml") {
            continue;
        }
        entries.push(read_entry(&path)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn info(name: &str) -> ExperimentInfo {
        ExperimentInfo {
            name: name.into(),
            revision: "abc123".into(),
            targets: vec!["train".into()],
            force: false,
            cloner: ClonerKind::Copy,
        }
    }

    #[test]
    fn enqueue_list_remove() {
        let dir = tempdir().unwrap();
        let q = ExperimentQueue::new(dir.path());

        q.enqueue(&info("b")).unwrap();
        q.enqueue(&info("a")).unwrap();
        let names: Vec<String> = q.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_string()));

        let entry = q.get("a").unwrap();
        assert_eq!(q.info(&entry).unwrap(), info("a"));

        q.remove("a").unwrap();
        assert!(matches!(q.get("a"), Err(StagehandError::ExperimentNotFound(_))));
        assert!(!dir.path().join(&entry.infofile).exists());
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let dir = tempdir().unwrap();
        let q = ExperimentQueue::new(dir.path());
        q.enqueue(&info("exp")).unwrap();
        assert!(q.enqueue(&info("exp")).is_err());
        assert!(q.enqueue(&info("../escape")).is_err());
    }

    #[test]
    fn reject_moves_entry_out_of_the_pending_list() {
        let dir = tempdir().unwrap();
        let q = ExperimentQueue::new(dir.path());
        q.enqueue(&info("bad")).unwrap();

        q.reject("bad").unwrap();
        assert!(q.list().unwrap().is_empty());
        let rejected = q.rejected().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].name, "bad");
    }

    #[test]
    fn rejected_entries_keep_their_revision_in_use() {
        let dir = tempdir().unwrap();
        let q = ExperimentQueue::new(dir.path());
        q.enqueue(&info("bad")).unwrap();
        q.enqueue(&info("good")).unwrap();

        q.reject("bad").unwrap();
        assert!(q.revision_in_use("abc123", "good").unwrap());

        q.remove("good").unwrap();
        assert!(q.revision_in_use("abc123", "good").unwrap());
        assert!(!q.revision_in_use("abc123", "bad").unwrap());
    }
}
