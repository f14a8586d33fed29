// src/store/objects.rs

//! Content-addressed object cache and run cache, both living under the
//! (possibly shared) cache directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::errors::{Result, StagehandError};
use crate::store::atomic_write;
use crate::store::hash::compute_file_hash;
use crate::store::records::StageRecord;

fn sharded(dir: &Path, key: &str, suffix: &str) -> PathBuf {
    let (head, tail) = key.split_at(key.len().min(2));
    dir.join(head).join(format!("{tail}{suffix}"))
}

/// `cache/objects/ab/cdef…`: file contents keyed by blake3 hash.
#[derive(Debug, Clone)]
pub struct ObjectCache {
    dir: PathBuf,
}

impl ObjectCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join("objects"),
        }
    }

    pub fn object_path(&self, hash: &str) -> PathBuf {
        sharded(&self.dir, hash, "")
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).is_file()
    }

    /// Store the file at `src`, returning its hash. Already-present objects
    /// are left untouched.
    pub fn put_file(&self, src: &Path) -> Result<String> {
        let hash = compute_file_hash(src)?;
        let dest = self.object_path(&hash);
        if dest.is_file() {
            trace!(hash = %hash, "object already cached");
            return Ok(hash);
        }
        copy_atomic(src, &dest)?;
        trace!(hash = %hash, src = ?src, "cached object");
        Ok(hash)
    }

    /// Materialize object `hash` at `dest`.
    pub fn restore(&self, hash: &str, dest: &Path) -> Result<()> {
        let src = self.object_path(hash);
        if !src.is_file() {
            return Err(StagehandError::RunCacheMiss(format!(
                "object {hash} missing from cache"
            )));
        }
        copy_atomic(&src, dest)
    }
}

/// `cache/runs/ab/cdef….toml`: committed stage records keyed by run key.
#[derive(Debug, Clone)]
pub struct RunCache {
    dir: PathBuf,
}

impl RunCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join("runs"),
        }
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        sharded(&self.dir, key, ".toml")
    }

    pub fn get(&self, key: &str) -> Result<Option<StageRecord>> {
        let path = self.entry_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let record = toml::from_str(&text).map_err(|e| {
            StagehandError::MetadataInvalid(format!("run-cache entry {}: {}", path.display(), e))
        })?;
        Ok(Some(record))
    }

    /// Write (or overwrite) the entry for `key`.
    pub fn put(&self, key: &str, record: &StageRecord) -> Result<()> {
        let text = toml::to_string(record)?;
        atomic_write(&self.entry_path(key), text.as_bytes())?;
        debug!(key = %key, "wrote run-cache entry");
        Ok(())
    }
}

fn copy_atomic(src: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| StagehandError::ConfigError(format!("invalid path {}", dest.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::copy(src, &tmp)?;
    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
