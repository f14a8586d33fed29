// src/store/mod.rs

//! Repository metadata store.
//!
//! Everything lives under `.stagehand/` of a workspace, except the cache,
//! which may be redirected to a directory shared by several workspaces:
//!
//! - [`lock`]: the advisory repository lock guarding mutation.
//! - [`hash`]: blake3 content hashing of files and directories.
//! - [`objects`]: the content-addressed object cache and the run cache.
//! - [`records`]: `stages.lock` and run keys.
//! - [`repo`]: [`Repository`], the real [`MetadataStore`].

pub mod hash;
pub mod lock;
pub mod objects;
pub mod records;
pub mod repo;

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::dag::{Stage, StageName};
use crate::errors::{Result, StagehandError};

pub use lock::RepoLock;
pub use objects::{ObjectCache, RunCache};
pub use records::{StageRecord, StagesLock, run_key};
pub use repo::Repository;

/// Shared repository metadata as seen by a stage executor.
///
/// Every mutating call may fail with `LockContention` when another mutator
/// holds the lock; callers wrap them in the locked retry protocol.
pub trait MetadataStore: Send + Sync + fmt::Debug {
    /// Workspace root that stage commands run in.
    fn root(&self) -> &Path;

    /// Whether the repository lock is currently held by anyone.
    fn is_locked(&self) -> bool;

    /// Names of stale stages among `[stage]`: empty when up to date.
    fn dry_run(&self, stage: &Stage) -> Result<Vec<StageName>>;

    /// Check the stage's outputs out of the run cache. `RunCacheMiss` when
    /// no entry exists for the current inputs.
    fn restore_run_cache(&self, stage: &Stage) -> Result<()>;

    /// Record the stage's current outputs in the object cache, the run cache
    /// and `stages.lock`.
    fn commit(&self, stage: &Stage) -> Result<()>;

    /// Same kind of store for another workspace (an isolated clone).
    fn open_at(&self, root: &Path) -> Result<Arc<dyn MetadataStore>>;
}

/// Write `bytes` to `path` via a temporary sibling and a rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StagehandError::ConfigError(format!("invalid path {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
