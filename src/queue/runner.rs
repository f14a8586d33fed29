// src/queue/runner.rs

//! Running queued experiments in isolated workspaces.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::engine::{ReproOptions, RunSummary, reproduce};
use crate::errors::{Result, StagehandError};
use crate::exec::CommandRunner;
use crate::queue::history::{ExperimentHistory, ExperimentRecord};
use crate::queue::store::{ExperimentQueue, QueueEntry};
use crate::store::Repository;
use crate::types::{IsolationMode, QueueMode};
use crate::workspace::{WorkspaceManager, cloner_for};

/// Lifecycle of one experiment run.
///
/// `Queued -> Prepared -> Running -> Collected -> Cleaned`; any step may
/// end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    Queued,
    Prepared,
    Running,
    Collected,
    Cleaned,
    Failed,
}

impl ExperimentState {
    pub fn can_advance_to(self, next: ExperimentState) -> bool {
        use ExperimentState::*;
        matches!(
            (self, next),
            (Queued, Prepared)
                | (Prepared, Running)
                | (Running, Collected)
                | (Collected, Cleaned)
                | (Queued | Prepared | Running | Collected, Failed)
        )
    }
}

/// Outcome of one experiment.
#[derive(Debug)]
pub struct ExperimentRun {
    pub name: String,
    pub state: ExperimentState,
    /// Isolated workspace, if it still exists.
    pub workspace: Option<PathBuf>,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
}

impl ExperimentRun {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ExperimentState::Queued,
            workspace: None,
            summary: None,
            error: None,
        }
    }

    fn advance(&mut self, next: ExperimentState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(experiment = %self.name, from = ?self.state, to = ?next, "experiment state");
        self.state = next;
    }

    fn fail(&mut self, err: impl std::fmt::Display) {
        error!(experiment = %self.name, error = %err, "experiment failed");
        self.error = Some(err.to_string());
        self.advance(ExperimentState::Failed);
    }

    pub fn succeeded(&self) -> bool {
        matches!(
            self.state,
            ExperimentState::Collected | ExperimentState::Cleaned
        )
    }
}

/// Drives queued experiments through [`ExperimentState`].
#[derive(Debug, Clone)]
pub struct QueueRunner {
    root: PathBuf,
    options: ReproOptions,
    runner: Arc<dyn CommandRunner>,
    mode: QueueMode,
    cleanup: bool,
    reject_failed: bool,
}

impl QueueRunner {
    /// `options` are the base reproduce options; each experiment's info file
    /// supplies targets, force and cloner.
    pub fn new(root: &Path, options: ReproOptions, runner: Arc<dyn CommandRunner>) -> Self {
        let cleanup = options.cleanup;
        Self {
            root: root.to_path_buf(),
            options,
            runner,
            mode: QueueMode::default(),
            cleanup,
            reject_failed: false,
        }
    }

    pub fn with_mode(mut self, mode: QueueMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_reject_failed(mut self, reject: bool) -> Self {
        self.reject_failed = reject;
        self
    }

    fn queue(&self) -> ExperimentQueue {
        ExperimentQueue::new(&self.root)
    }

    /// Run the named experiments, or every queued one when `names` is empty.
    pub async fn run(&self, names: &[String]) -> Result<Vec<ExperimentRun>> {
        let queue = self.queue();
        let entries: Vec<QueueEntry> = if names.is_empty() {
            queue.list()?
        } else {
            names
                .iter()
                .map(|n| queue.get(n))
                .collect::<Result<Vec<_>>>()?
        };
        info!(experiments = entries.len(), mode = ?self.mode, "running queued experiments");

        let runs = match self.mode {
            QueueMode::Sequential => {
                let mut runs = Vec::with_capacity(entries.len());
                for entry in entries.iter() {
                    runs.push(self.run_one(entry).await);
                }
                runs
            }
            QueueMode::Parallel => join_all(entries.iter().map(|e| self.run_one(e))).await,
        };
        Ok(runs)
    }

    async fn run_one(&self, entry: &QueueEntry) -> ExperimentRun {
        let mut run = ExperimentRun::new(&entry.name);
        let queue = self.queue();

        let info = match queue.info(entry) {
            Ok(info) => info,
            Err(e) => {
                run.fail(e);
                return run;
            }
        };

        let cloner = cloner_for(info.cloner);
        let manager = WorkspaceManager::new(cloner.clone(), self.cleanup);
        let dir = match manager.prepare_at(&self.root, &entry.name, &entry.revision).await {
            Ok(dir) => dir,
            Err(e) => {
                run.fail(e);
                self.handle_failure(&queue, &entry.name);
                return run;
            }
        };
        run.workspace = Some(dir.clone());
        run.advance(ExperimentState::Prepared);

        let options = ReproOptions {
            targets: info.targets.clone(),
            force: info.force,
            isolation: IsolationMode::Shared,
            cloner: info.cloner,
            ..self.options.clone()
        };

        run.advance(ExperimentState::Running);
        match reproduce(&dir, &options, self.runner.clone()).await {
            Ok(summary) if summary.all_succeeded() => {
                let collected = self.collect(entry, &dir, &summary);
                run.summary = Some(summary);
                match collected {
                    Ok(()) => {
                        run.advance(ExperimentState::Collected);
                        if let Err(e) = queue.remove(&entry.name) {
                            warn!(experiment = %entry.name, error = %e, "failed to dequeue collected experiment");
                        }
                        self.drop_revision(&queue, cloner.as_ref(), entry);
                    }
                    Err(e) => {
                        run.fail(e);
                        self.handle_failure(&queue, &entry.name);
                    }
                }
            }
            Ok(summary) => {
                let reason = summary
                    .first_failure()
                    .map(|(stage, err)| format!("stage '{stage}': {err}"))
                    .unwrap_or_else(|| "not all stages completed".to_string());
                run.summary = Some(summary);
                run.fail(reason);
                self.handle_failure(&queue, &entry.name);
            }
            Err(e) => {
                run.fail(e);
                self.handle_failure(&queue, &entry.name);
            }
        }

        manager.release(&dir).await;
        if !dir.exists() {
            run.workspace = None;
            if run.state == ExperimentState::Collected {
                run.advance(ExperimentState::Cleaned);
            }
        }
        run
    }

    fn collect(&self, entry: &QueueEntry, dir: &Path, summary: &RunSummary) -> Result<()> {
        let repo = Repository::open(dir)?;
        let lock = repo.read_stages_lock()?;
        let outcomes: BTreeMap<String, String> = summary
            .reports
            .iter()
            .map(|r| (r.stage.clone(), r.outcome.to_string()))
            .collect();

        let record = ExperimentRecord {
            name: entry.name.clone(),
            revision: entry.revision.clone(),
            collected_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            outcomes,
            stages: lock.stage,
        };
        ExperimentHistory::new(&self.root).record(&record)
    }

    fn handle_failure(&self, queue: &ExperimentQueue, name: &str) {
        if !self.reject_failed {
            info!(experiment = %name, "leaving failed experiment queued");
            return;
        }
        if let Err(e) = queue.reject(name) {
            warn!(experiment = %name, error = %e, "failed to reject experiment");
        }
    }

    fn drop_revision(
        &self,
        queue: &ExperimentQueue,
        cloner: &dyn crate::workspace::WorkspaceCloner,
        entry: &QueueEntry,
    ) {
        let in_use = queue
            .revision_in_use(&entry.revision, &entry.name)
            .unwrap_or(true);
        if in_use {
            return;
        }
        if let Err(e) = cloner.drop_stash(&self.root, &entry.name, &entry.revision) {
            warn!(experiment = %entry.name, error = %e, "failed to drop stashed revision");
        }
    }
}

/// Failing experiments as an error, for callers that want a single result.
pub fn first_failure(runs: &[ExperimentRun]) -> Option<StagehandError> {
    runs.iter().find(|r| !r.succeeded()).map(|r| {
        StagehandError::Other(anyhow::anyhow!(
            "experiment '{}' failed: {}",
            r.name,
            r.error.as_deref().unwrap_or("unknown error")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::ExperimentState::*;

    #[test]
    fn state_machine_only_moves_forward() {
        assert!(Queued.can_advance_to(Prepared));
        assert!(Running.can_advance_to(Collected));
        assert!(Collected.can_advance_to(Cleaned));
        assert!(Running.can_advance_to(Failed));
        assert!(!Queued.can_advance_to(Running));
        assert!(!Cleaned.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Prepared));
    }
}
