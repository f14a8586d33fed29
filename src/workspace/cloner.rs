// src/workspace/cloner.rs

//! Ways of materializing a copy of a workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::META_DIR;
use crate::errors::{Result, StagehandError};
use crate::store::hash::{compute_aggregate_hash, compute_file_hash, relative_key};
use crate::types::ClonerKind;

/// Entries of `.stagehand/` that belong to one workspace only and are never
/// copied into another.
const LOCAL_META: &[&str] = &["tmp", "cache", "lock", "queue", "stash", "experiments"];

/// Subdirectory of `.stagehand/` holding copy-cloner snapshots.
const STASH_DIR: &str = "stash";

/// Creates isolated copies of a workspace and captures revisions of it.
pub trait WorkspaceCloner: Send + Sync + fmt::Debug {
    /// Copy `source` (including uncommitted changes) into `dest`, which must
    /// not exist yet.
    fn clone_into(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Capture the current working tree of `source` under `name`; returns a
    /// revision id usable with [`WorkspaceCloner::checkout`].
    fn stash(&self, source: &Path, name: &str) -> Result<String>;

    /// Turn the working tree at `dest` into `revision`.
    fn checkout(&self, source: &Path, dest: &Path, name: &str, revision: &str) -> Result<()>;

    /// Forget a captured revision.
    fn drop_stash(&self, source: &Path, name: &str, revision: &str) -> Result<()>;
}

pub fn cloner_for(kind: ClonerKind) -> Arc<dyn WorkspaceCloner> {
    match kind {
        ClonerKind::Copy => Arc::new(CopyCloner),
        ClonerKind::Git => Arc::new(GitCloner::default()),
    }
}

/// Plain recursive copy of the working tree.
///
/// `.git` and the workspace-local parts of `.stagehand/` are skipped.
/// Revisions are content-addressed snapshots under `.stagehand/stash/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyCloner;

impl CopyCloner {
    fn skip(root: &Path, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(root) else {
            return false;
        };
        let mut parts = rel.components().map(|c| c.as_os_str().to_string_lossy());
        match parts.next().as_deref() {
            Some(".git") => true,
            Some(META_DIR) => match parts.next() {
                Some(second) => LOCAL_META.contains(&second.as_ref()),
                None => false,
            },
            _ => false,
        }
    }

    fn copy_tree(&self, root: &Path, from: &Path, to: &Path) -> Result<()> {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            let path = entry.path();
            if Self::skip(root, &path) {
                continue;
            }
            let target = to.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.copy_tree(root, &path, &target)?;
            } else if file_type.is_file() {
                fs::copy(&path, &target)?;
            } else if file_type.is_symlink() {
                copy_symlink(&path, &target)?;
            }
        }
        Ok(())
    }

    /// Remove everything in `dir` except `.stagehand/`.
    fn clear_tree(dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name() == META_DIR {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn snapshot_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_name() == META_DIR && dir == root {
                continue;
            }
            if Self::skip(root, &path) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                Self::snapshot_files(root, &path, out)?;
            } else if entry.file_type()?.is_file() {
                out.insert(relative_key(root, &path), compute_file_hash(&path)?);
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn copy_symlink(path: &Path, target: &Path) -> Result<()> {
    let link = fs::read_link(path)?;
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(path: &Path, target: &Path) -> Result<()> {
    fs::copy(path, target)?;
    Ok(())
}

impl WorkspaceCloner for CopyCloner {
    fn clone_into(&self, source: &Path, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(StagehandError::WorkspaceSetupFailed(format!(
                "{} already exists",
                dest.display()
            )));
        }
        debug!(source = ?source, dest = ?dest, "copying workspace");
        self.copy_tree(source, source, dest)
    }

    fn stash(&self, source: &Path, name: &str) -> Result<String> {
        let mut files = BTreeMap::new();
        Self::snapshot_files(source, source, &mut files)?;
        let revision: String = compute_aggregate_hash(&files).chars().take(16).collect();

        let stash_dir = source.join(META_DIR).join(STASH_DIR).join(&revision);
        if stash_dir.exists() {
            debug!(name, revision = %revision, "reusing existing snapshot");
            return Ok(revision);
        }

        let staging = source
            .join(META_DIR)
            .join(STASH_DIR)
            .join(format!(".{}-{}", revision, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&staging)?;
        for rel in files.keys() {
            let target = staging.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source.join(rel), &target)?;
        }
        fs::rename(&staging, &stash_dir)?;

        info!(name, revision = %revision, files = files.len(), "captured workspace snapshot");
        Ok(revision)
    }

    fn checkout(&self, source: &Path, dest: &Path, _name: &str, revision: &str) -> Result<()> {
        let stash_dir = source.join(META_DIR).join(STASH_DIR).join(revision);
        if !stash_dir.is_dir() {
            return Err(StagehandError::WorkspaceSetupFailed(format!(
                "snapshot {revision} not found in {}",
                source.display()
            )));
        }
        Self::clear_tree(dest)?;
        self.copy_tree(&stash_dir, &stash_dir, dest)
    }

    fn drop_stash(&self, source: &Path, _name: &str, revision: &str) -> Result<()> {
        let stash_dir = source.join(META_DIR).join(STASH_DIR).join(revision);
        if stash_dir.exists() {
            fs::remove_dir_all(&stash_dir)?;
        }
        Ok(())
    }
}

/// `git clone` of the workspace plus its uncommitted diff.
///
/// Revisions are `git stash create` commits kept reachable under
/// `refs/stagehand/queue/<name>`.
#[derive(Debug, Clone, Copy)]
pub struct GitCloner {
    /// Commit the applied patch so the clone starts from a clean tree.
    pub commit_patch: bool,
}

impl Default for GitCloner {
    fn default() -> Self {
        Self { commit_patch: true }
    }
}

fn git(dir: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(dir)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = cmd.spawn().map_err(|e| {
        StagehandError::WorkspaceSetupFailed(format!("failed to spawn git {}: {}", args.join(" "), e))
    })?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input)?;
    }
    let output = child.wait_with_output()?;

    if !output.status.success() {
        return Err(StagehandError::WorkspaceSetupFailed(format!(
            "git {} failed in {}: {}",
            args.join(" "),
            dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

fn queue_ref(name: &str) -> String {
    format!("refs/stagehand/queue/{name}")
}

impl GitCloner {
    fn apply_uncommitted(&self, source: &Path, dest: &Path) -> Result<()> {
        let patch = git(source, &["diff", "HEAD", "--binary"], None)?;
        if patch.is_empty() {
            debug!(source = ?source, "no uncommitted changes to carry over");
            return Ok(());
        }

        let mut patch = patch.into_bytes();
        patch.push(b'\n');
        git(dest, &["apply", "--whitespace=fix", "-"], Some(&patch))?;

        if self.commit_patch {
            git(dest, &["add", "-A"], None)?;
            git(
                dest,
                &[
                    "-c",
                    "user.name=stagehand",
                    "-c",
                    "user.email=stagehand@localhost",
                    "commit",
                    "--no-verify",
                    "-m",
                    "stagehand: apply uncommitted changes",
                ],
                None,
            )?;
        }
        Ok(())
    }
}

impl WorkspaceCloner for GitCloner {
    fn clone_into(&self, source: &Path, dest: &Path) -> Result<()> {
        let dest_str = dest.to_string_lossy();
        let source_str = source.to_string_lossy();
        let parent = dest.parent().unwrap_or(source);
        git(parent, &["clone", "--quiet", &source_str, &dest_str], None)?;
        self.apply_uncommitted(source, dest)?;

        // Settings and committed stage state usually are not under version
        // control; carry them over so the clone sees the same pipeline state.
        for file in ["config.toml", "stages.lock"] {
            let from = source.join(META_DIR).join(file);
            if from.is_file() {
                let to = dest.join(META_DIR).join(file);
                fs::create_dir_all(dest.join(META_DIR))?;
                fs::copy(&from, &to)?;
            }
        }
        Ok(())
    }

    fn stash(&self, source: &Path, name: &str) -> Result<String> {
        let mut revision = git(source, &["stash", "create"], None)?;
        if revision.is_empty() {
            revision = git(source, &["rev-parse", "HEAD"], None)?;
        }
        git(source, &["update-ref", &queue_ref(name), &revision], None)?;
        info!(name, revision = %revision, "captured git revision");
        Ok(revision)
    }

    fn checkout(&self, source: &Path, dest: &Path, name: &str, revision: &str) -> Result<()> {
        let source_str = source.to_string_lossy();
        git(dest, &["fetch", "--quiet", &source_str, &queue_ref(name)], None)?;
        git(dest, &["checkout", "--quiet", "--detach", "FETCH_HEAD"], None)?;
        debug!(name, revision, "checked out queued revision");
        Ok(())
    }

    fn drop_stash(&self, source: &Path, name: &str, _revision: &str) -> Result<()> {
        git(source, &["update-ref", "-d", &queue_ref(name)], None)?;
        Ok(())
    }
}
