// src/store/lock.rs

//! Advisory repository lock: `.stagehand/lock` exists while a mutator holds it.
//!
//! The file records the holder's pid. A lock whose holder is known to be dead
//! (a crashed process) is stale: it does not count as held and the next
//! `acquire` reclaims it. Liveness is only checked where `/proc` exists;
//! elsewhere a leftover lock must be removed by hand.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{trace, warn};

use crate::errors::{Result, StagehandError};

pub const LOCK_FILE: &str = "lock";

/// Held repository lock; released on drop.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    /// Take the lock in `meta_dir`, failing with `LockContention` if another
    /// holder exists. Never blocks.
    pub fn acquire(meta_dir: &Path) -> Result<Self> {
        fs::create_dir_all(meta_dir)?;
        let path = meta_dir.join(LOCK_FILE);

        match Self::create(&path) {
            Err(StagehandError::LockContention(_)) if is_stale(&path) => {
                warn!(lock = ?path, holder = ?holder_pid(&path), "reclaiming stale repository lock");
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Self::create(&path)
            }
            other => other,
        }
    }

    fn create(path: &Path) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                trace!(lock = ?path, "acquired repository lock");
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StagehandError::LockContention(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a live holder has the lock in `meta_dir`.
    pub fn is_held(meta_dir: &Path) -> bool {
        let path = meta_dir.join(LOCK_FILE);
        path.exists() && !is_stale(&path)
    }
}

/// Pid recorded in the lock file. `None` while the holder is still writing it.
fn holder_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_stale(path: &Path) -> bool {
    match holder_pid(path) {
        Some(pid) => !process_alive(pid),
        None => false,
    }
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = ?self.path, error = %e, "failed to release repository lock");
        }
    }
}
