// src/store/repo.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{META_DIR, Settings, load_settings, save_settings};
use crate::dag::{Stage, StageName};
use crate::errors::{Result, StagehandError};
use crate::store::MetadataStore;
use crate::store::hash::{path_hash, snapshot_path};
use crate::store::lock::RepoLock;
use crate::store::objects::{ObjectCache, RunCache};
use crate::store::records::{STAGES_LOCK_FILE, StageRecord, StagesLock, run_key};

/// Entries written to `.stagehand/.gitignore` on init.
const META_GITIGNORE: &str = "/lock\n/cache/\n/tmp/\n";

/// A workspace with its `.stagehand/` metadata directory.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    meta_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Repository {
    /// Open the workspace at `root`. Settings are read from
    /// `.stagehand/config.toml`; the cache directory honours
    /// `core.cache_dir`.
    pub fn open(root: &Path) -> Result<Self> {
        let root = std::path::absolute(root)?;
        let settings = load_settings(&root)?;
        let meta_dir = root.join(META_DIR);
        let cache_dir = resolve_cache_dir(&root, &settings);
        Ok(Self {
            root,
            meta_dir,
            cache_dir,
        })
    }

    /// Create `.stagehand/` (settings, cache, gitignore) if needed and open
    /// the workspace.
    pub fn init(root: &Path) -> Result<Self> {
        let root = std::path::absolute(root)?;
        let meta_dir = root.join(META_DIR);
        fs::create_dir_all(&meta_dir)?;

        if !crate::config::loader::settings_path(&root).exists() {
            save_settings(&root, &Settings::default())?;
        }
        let gitignore = meta_dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, META_GITIGNORE)?;
        }

        let repo = Self::open(&root)?;
        fs::create_dir_all(repo.cache_dir.join("objects"))?;
        fs::create_dir_all(repo.cache_dir.join("runs"))?;
        info!(root = ?repo.root, "initialised stagehand repository");
        Ok(repo)
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn objects(&self) -> ObjectCache {
        ObjectCache::new(&self.cache_dir)
    }

    pub fn runs(&self) -> RunCache {
        RunCache::new(&self.cache_dir)
    }

    pub fn stages_lock_path(&self) -> PathBuf {
        self.meta_dir.join(STAGES_LOCK_FILE)
    }

    pub fn read_stages_lock(&self) -> Result<StagesLock> {
        StagesLock::load(&self.stages_lock_path())
    }

    /// Current content hash of every dependency of `stage`.
    pub fn snapshot_deps(&self, stage: &Stage) -> Result<BTreeMap<String, String>> {
        let mut deps = BTreeMap::new();
        for dep in stage.deps.iter() {
            deps.insert(dep.clone(), path_hash(&self.root.join(dep))?);
        }
        Ok(deps)
    }

    /// Whether `stage` differs from its committed record.
    pub fn is_stale(&self, stage: &Stage, lock: &StagesLock) -> Result<bool> {
        let Some(record) = lock.get(&stage.name) else {
            debug!(stage = %stage.name, "no committed record");
            return Ok(true);
        };

        if record.definition_hash != stage.definition_hash {
            debug!(stage = %stage.name, "definition changed");
            return Ok(true);
        }

        if self.snapshot_deps(stage)? != record.deps {
            debug!(stage = %stage.name, "dependencies changed");
            return Ok(true);
        }

        for out in stage.outs.iter() {
            let committed = record.outs.get(out).map(|s| s.hash.as_str());
            let current = path_hash(&self.root.join(out))?;
            if committed != Some(current.as_str()) {
                debug!(stage = %stage.name, out = %out, "output missing or changed");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Check every output of `record` out of the object cache into the
    /// workspace. Nothing is touched unless all objects are present.
    pub fn checkout(&self, stage: &str, record: &StageRecord) -> Result<()> {
        let objects = self.objects();

        for snap in record.outs.values() {
            let complete = if snap.dir {
                snap.files.values().all(|h| objects.contains(h))
            } else {
                objects.contains(&snap.hash)
            };
            if !complete {
                return Err(StagehandError::RunCacheMiss(stage.to_string()));
            }
        }

        for (out, snap) in record.outs.iter() {
            let dest = self.root.join(out);
            if snap.dir {
                if dest.exists() {
                    remove_path(&dest)?;
                }
                fs::create_dir_all(&dest)?;
                for (rel, hash) in snap.files.iter() {
                    objects.restore(hash, &dest.join(rel))?;
                }
            } else {
                if dest.is_dir() {
                    fs::remove_dir_all(&dest)?;
                }
                objects.restore(&snap.hash, &dest)?;
            }
        }
        Ok(())
    }

    fn record_in_lock(&self, stage: &str, record: StageRecord) -> Result<()> {
        let path = self.stages_lock_path();
        let mut lock = StagesLock::load(&path)?;
        lock.stage.insert(stage.to_string(), record);
        lock.save(&path)
    }
}

impl MetadataStore for Repository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_locked(&self) -> bool {
        RepoLock::is_held(&self.meta_dir)
    }

    fn dry_run(&self, stage: &Stage) -> Result<Vec<StageName>> {
        let lock = self.read_stages_lock()?;
        if self.is_stale(stage, &lock)? {
            Ok(vec![stage.name.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    fn restore_run_cache(&self, stage: &Stage) -> Result<()> {
        let _guard = RepoLock::acquire(&self.meta_dir)?;

        let deps = self.snapshot_deps(stage)?;
        let key = run_key(&stage.definition_hash, &deps);
        let record = self
            .runs()
            .get(&key)?
            .ok_or_else(|| StagehandError::RunCacheMiss(stage.name.clone()))?;

        self.checkout(&stage.name, &record)?;
        self.record_in_lock(&stage.name, record)?;
        debug!(stage = %stage.name, key = %key, "restored outputs from run cache");
        Ok(())
    }

    fn commit(&self, stage: &Stage) -> Result<()> {
        let _guard = RepoLock::acquire(&self.meta_dir)?;
        let objects = self.objects();

        let deps = self.snapshot_deps(stage)?;
        let mut outs = BTreeMap::new();
        for out in stage.outs.iter() {
            let path = self.root.join(out);
            let snap = snapshot_path(&path)?.ok_or_else(|| {
                StagehandError::Other(anyhow::anyhow!(
                    "stage '{}' did not produce declared output '{}'",
                    stage.name,
                    out
                ))
            })?;

            if snap.dir {
                for rel in snap.files.keys() {
                    objects.put_file(&path.join(rel))?;
                }
            } else {
                objects.put_file(&path)?;
            }
            outs.insert(out.clone(), snap);
        }

        let record = StageRecord {
            definition_hash: stage.definition_hash.clone(),
            deps,
            outs,
        };
        let key = run_key(&record.definition_hash, &record.deps);
        self.runs().put(&key, &record)?;
        self.record_in_lock(&stage.name, record)?;
        debug!(stage = %stage.name, key = %key, "committed stage");
        Ok(())
    }

    fn open_at(&self, root: &Path) -> Result<Arc<dyn MetadataStore>> {
        Ok(Arc::new(Repository::open(root)?))
    }
}

fn resolve_cache_dir(root: &Path, settings: &Settings) -> PathBuf {
    match &settings.core.cache_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => root.join(dir),
        None => root.join(META_DIR).join("cache"),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}
