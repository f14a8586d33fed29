// src/queue/mod.rs

//! Experiment queue: deferred, named pipeline runs bound to a captured
//! revision of the workspace.
//!
//! - [`store`]: the durable queue (enqueue, list, remove, reject).
//! - [`history`]: collected experiments and applying them to the workspace.
//! - [`runner`]: running queued experiments in isolated workspaces.

pub mod history;
pub mod runner;
pub mod store;

use std::path::Path;

use tracing::warn;

use crate::errors::{Result, StagehandError};
use crate::types::ClonerKind;
use crate::workspace::cloner_for;

pub use history::{ExperimentHistory, ExperimentRecord};
pub use runner::{ExperimentRun, ExperimentState, QueueRunner, first_failure};
pub use store::{ExperimentInfo, ExperimentQueue, QueueEntry};

/// Capture the current state of the workspace at `root` and queue it as
/// experiment `name`.
pub fn enqueue_experiment(
    root: &Path,
    name: &str,
    targets: Vec<String>,
    force: bool,
    cloner: ClonerKind,
) -> Result<QueueEntry> {
    store::validate_name(name)?;
    let queue = ExperimentQueue::new(root);
    if queue.get(name).is_ok() {
        return Err(StagehandError::ConfigError(format!(
            "experiment '{name}' is already queued"
        )));
    }

    let revision = cloner_for(cloner).stash(root, name)?;
    queue.enqueue(&ExperimentInfo {
        name: name.to_string(),
        revision,
        targets,
        force,
        cloner,
    })
}

/// Drop experiment `name` from the queue, forgetting its captured revision
/// unless another queued or rejected entry still needs it.
///
/// The revision is dropped by the cloner recorded at enqueue time;
/// `fallback` is used only when the info file is unreadable.
pub fn remove_experiment(root: &Path, name: &str, fallback: ClonerKind) -> Result<QueueEntry> {
    let queue = ExperimentQueue::new(root);
    let entry = queue.get(name)?;
    let kind = match queue.info(&entry) {
        Ok(info) => info.cloner,
        Err(e) => {
            warn!(name, error = %e, "unreadable experiment info; using configured cloner");
            fallback
        }
    };

    let entry = queue.remove(name)?;
    if !queue.revision_in_use(&entry.revision, &entry.name)? {
        cloner_for(kind).drop_stash(root, &entry.name, &entry.revision)?;
    }
    Ok(entry)
}
