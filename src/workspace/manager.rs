// src/workspace/manager.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{META_DIR, load_settings, save_settings};
use crate::errors::{Result, StagehandError};
use crate::store::Repository;
use crate::workspace::cloner::WorkspaceCloner;

/// Creates and tears down isolated workspaces under `<base>/.stagehand/tmp/`.
///
/// Every workspace shares the base's cache directory, so run-cache entries
/// written in one are visible to all others and to the base itself.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    cloner: Arc<dyn WorkspaceCloner>,
    cleanup: bool,
}

impl WorkspaceManager {
    pub fn new(cloner: Arc<dyn WorkspaceCloner>, cleanup: bool) -> Self {
        Self { cloner, cleanup }
    }

    /// Clone `base` into `.stagehand/tmp/tmp_<name>` (or `tmp_<random>`),
    /// carrying uncommitted changes and redirecting the cache.
    ///
    /// On any failure the partially created directory is removed and
    /// `WorkspaceSetupFailed` is returned.
    pub async fn prepare(&self, base: &Path, name: Option<&str>) -> Result<PathBuf> {
        self.prepare_inner(base, name, None).await
    }

    /// Like [`prepare`](Self::prepare), then check out a stashed revision.
    pub async fn prepare_at(&self, base: &Path, name: &str, revision: &str) -> Result<PathBuf> {
        self.prepare_inner(base, Some(name), Some(revision)).await
    }

    async fn prepare_inner(
        &self,
        base: &Path,
        name: Option<&str>,
        revision: Option<&str>,
    ) -> Result<PathBuf> {
        let cloner = self.cloner.clone();
        let base = base.to_path_buf();
        let name = name.map(str::to_string);
        let revision = revision.map(str::to_string);

        tokio::task::spawn_blocking(move || {
            prepare_blocking(cloner.as_ref(), &base, name.as_deref(), revision.as_deref())
        })
        .await
        .map_err(|e| StagehandError::WorkspaceSetupFailed(format!("setup task panicked: {e}")))?
    }

    /// Remove `dir` recursively, regardless of the cleanup setting.
    pub async fn cleanup(&self, dir: &Path) -> Result<()> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || remove_workspace(&dir))
            .await
            .map_err(|e| StagehandError::Other(e.into()))?
    }

    /// Remove `dir` unless cleanup was disabled. Failures are logged.
    pub async fn release(&self, dir: &Path) {
        if !self.cleanup {
            info!(workspace = ?dir, "cleanup disabled; keeping workspace");
            return;
        }
        if let Err(e) = self.cleanup(dir).await {
            warn!(workspace = ?dir, error = %e, "failed to remove workspace");
        }
    }
}

/// `tmp_<name>` with anything but `[A-Za-z0-9._-]` replaced.
fn workspace_dir_name(name: Option<&str>) -> String {
    match name {
        Some(name) => {
            let clean: String = name
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            format!("tmp_{clean}")
        }
        None => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("tmp_{}", &id[..8])
        }
    }
}

fn prepare_blocking(
    cloner: &dyn WorkspaceCloner,
    base: &Path,
    name: Option<&str>,
    revision: Option<&str>,
) -> Result<PathBuf> {
    let tmp_root = base.join(META_DIR).join("tmp");
    fs::create_dir_all(&tmp_root)?;
    let dest = tmp_root.join(workspace_dir_name(name));

    if dest.exists() {
        return Err(StagehandError::WorkspaceSetupFailed(format!(
            "workspace {} already exists",
            dest.display()
        )));
    }

    let setup = || -> Result<()> {
        cloner.clone_into(base, &dest)?;
        if let (Some(name), Some(revision)) = (name, revision) {
            cloner.checkout(base, &dest, name, revision)?;
        }
        redirect_cache(base, &dest)
    };

    match setup() {
        Ok(()) => {
            info!(workspace = ?dest, "prepared isolated workspace");
            Ok(dest)
        }
        Err(e) => {
            if dest.exists() {
                if let Err(rm) = fs::remove_dir_all(&dest) {
                    warn!(workspace = ?dest, error = %rm, "failed to remove half-prepared workspace");
                }
            }
            Err(match e {
                StagehandError::WorkspaceSetupFailed(_) => e,
                other => StagehandError::WorkspaceSetupFailed(format!(
                    "{}: {}",
                    dest.display(),
                    other
                )),
            })
        }
    }
}

/// Point `dest`'s `core.cache_dir` at the cache that `base` uses.
pub fn redirect_cache(base: &Path, dest: &Path) -> Result<()> {
    let shared = Repository::open(base)?.cache_dir().to_path_buf();
    let mut settings = load_settings(dest)?;
    settings.core.cache_dir = Some(shared.clone());
    save_settings(dest, &settings)?;
    debug!(workspace = ?dest, cache = ?shared, "redirected cache directory");
    Ok(())
}

fn remove_workspace(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
        debug!(workspace = ?dir, "removed workspace");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::cloner::CopyCloner;
    use tempfile::tempdir;

    #[tokio::test]
    async fn prepared_workspace_shares_base_cache() {
        let base = tempdir().unwrap();
        let repo = Repository::init(base.path()).unwrap();
        fs::write(base.path().join("input.txt"), "hello").unwrap();

        let manager = WorkspaceManager::new(Arc::new(CopyCloner), true);
        let dir = manager.prepare(base.path(), Some("exp 1")).await.unwrap();

        assert!(dir.ends_with("tmp_exp_1"));
        assert_eq!(fs::read_to_string(dir.join("input.txt")).unwrap(), "hello");
        let clone = Repository::open(&dir).unwrap();
        assert_eq!(clone.cache_dir(), repo.cache_dir());

        manager.release(&dir).await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn unknown_revision_leaves_nothing_behind() {
        let base = tempdir().unwrap();
        Repository::init(base.path()).unwrap();

        let manager = WorkspaceManager::new(Arc::new(CopyCloner), true);
        let err = manager
            .prepare_at(base.path(), "ghost", "0000000000000000")
            .await
            .unwrap_err();

        assert!(matches!(err, StagehandError::WorkspaceSetupFailed(_)));
        assert!(!base.path().join(".stagehand/tmp/tmp_ghost").exists());
    }

    #[tokio::test]
    async fn release_keeps_workspace_when_cleanup_disabled() {
        let base = tempdir().unwrap();
        Repository::init(base.path()).unwrap();

        let manager = WorkspaceManager::new(Arc::new(CopyCloner), false);
        let dir = manager.prepare(base.path(), None).await.unwrap();
        manager.release(&dir).await;
        assert!(dir.exists());
    }
}
