// src/store/hash.rs

//! Content hashing of stage dependencies and outputs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Hash recorded for a dependency path that does not exist.
pub const MISSING: &str = "missing";

/// Content state of one file or directory at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSnapshot {
    /// File hash, or aggregate hash over `files` for directories.
    pub hash: String,
    #[serde(default)]
    pub dir: bool,
    /// Directory members: path relative to the directory -> file hash.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

/// Compute the hash of a single file.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file =
        File::open(path).with_context(|| format!("opening file for hashing: {:?}", path))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Aggregate hash over `(relative path, file hash)` pairs.
///
/// Iterating a `BTreeMap` keeps the order, and therefore the hash, stable.
pub fn compute_aggregate_hash(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Hasher::new();
    for (rel, hash) in files.iter() {
        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        hasher.update(hash.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Snapshot a file or directory; `None` if nothing exists at `path`.
pub fn snapshot_path(path: &Path) -> Result<Option<PathSnapshot>> {
    if path.is_file() {
        let hash = compute_file_hash(path)?;
        return Ok(Some(PathSnapshot {
            hash,
            dir: false,
            files: BTreeMap::new(),
        }));
    }

    if path.is_dir() {
        let mut files = BTreeMap::new();
        collect_files(path, path, &mut files)?;
        let hash = compute_aggregate_hash(&files);
        trace!(path = ?path, files = files.len(), hash = %hash, "hashed directory");
        return Ok(Some(PathSnapshot {
            hash,
            dir: true,
            files,
        }));
    }

    Ok(None)
}

/// Hash of whatever is at `path`, or [`MISSING`].
pub fn path_hash(path: &Path) -> Result<String> {
    Ok(snapshot_path(path)?
        .map(|s| s.hash)
        .unwrap_or_else(|| MISSING.to_string()))
}

fn collect_files(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("listing directory {:?}", dir))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else if path.is_file() {
            let rel = relative_key(base, &path);
            out.insert(rel, compute_file_hash(&path)?);
        }
    }
    Ok(())
}

/// `/`-separated path of `path` relative to `base`.
pub fn relative_key(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
