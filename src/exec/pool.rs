// src/exec/pool.rs

//! Local worker pool: one tokio task per submitted stage, bounded by a
//! number of worker slots.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::dag::{Stage, TaskSubmitter};
use crate::errors::{SharedError, StagehandError};
use crate::exec::executor::{StageExecutor, StageReport};

/// What a stage task resolves to.
pub type TaskResult = std::result::Result<StageReport, SharedError>;

/// Cloneable handle to a submitted stage; every dependent and the
/// aggregator await the same underlying task.
pub type TaskHandle = Shared<BoxFuture<'static, TaskResult>>;

/// In-process scheduler implementing [`TaskSubmitter`].
///
/// A task is spawned at submission time. It first waits for every upstream
/// handle, then for a free worker slot, and only then runs the executor.
/// Tasks keep running even if nobody awaits their handle.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    executor: Arc<StageExecutor>,
    slots: Arc<Semaphore>,
    force: bool,
}

impl WorkerPool {
    pub fn new(executor: StageExecutor, workers: usize, force: bool) -> Self {
        Self {
            executor: Arc::new(executor),
            slots: Arc::new(Semaphore::new(workers.max(1))),
            force,
        }
    }
}

impl TaskSubmitter for WorkerPool {
    type Handle = TaskHandle;

    fn submit(&mut self, stage: &Stage, deps: Vec<TaskHandle>) -> TaskHandle {
        let stage = stage.clone();
        let executor = self.executor.clone();
        let slots = self.slots.clone();
        let force = self.force;

        let task = tokio::spawn(async move {
            let mut upstream = Vec::with_capacity(deps.len());
            for result in join_all(deps).await {
                match result {
                    Ok(report) => upstream.push(report),
                    Err(err) => {
                        debug!(stage = %stage.name, error = %err, "upstream failed; not running");
                        return Err(Arc::new(StagehandError::UpstreamFailed {
                            stage: stage.name.clone(),
                            reason: err.to_string(),
                        }));
                    }
                }
            }

            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|e| Arc::new(StagehandError::Other(e.into())))?;
            info!(stage = %stage.name, "dispatching stage");

            executor
                .execute(&stage, force, &upstream)
                .await
                .map_err(Arc::new)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => Err(Arc::new(StagehandError::Other(join_err.into()))),
            }
        }
        .boxed()
        .shared()
    }
}
