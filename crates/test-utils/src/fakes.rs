#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stagehand::dag::{Stage, StageName, TaskSubmitter};
use stagehand::errors::{Result, StagehandError};
use stagehand::exec::{CommandRunner, ShellRunner};
use stagehand::store::MetadataStore;

/// A submitter that:
/// - hands out sequential integer handles
/// - records every submission together with the handles it waited on.
#[derive(Debug, Default)]
pub struct RecordingSubmitter {
    pub submitted: Vec<(StageName, Vec<usize>)>,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<&str> {
        self.submitted.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn position(&self, stage: &str) -> Option<usize> {
        self.submitted.iter().position(|(n, _)| n == stage)
    }

    /// Names of the submissions `stage` waited on.
    pub fn deps_of(&self, stage: &str) -> Vec<&str> {
        let Some(idx) = self.position(stage) else {
            return Vec::new();
        };
        self.submitted[idx]
            .1
            .iter()
            .map(|h| self.submitted[*h].0.as_str())
            .collect()
    }
}

impl TaskSubmitter for RecordingSubmitter {
    type Handle = usize;

    fn submit(&mut self, stage: &Stage, deps: Vec<usize>) -> usize {
        self.submitted.push((stage.name.clone(), deps));
        self.submitted.len() - 1
    }
}

/// One command invocation seen by [`RecordingRunner`].
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub stage: StageName,
    pub started: Instant,
    pub finished: Instant,
}

/// A runner that:
/// - runs the real shell command (so outputs exist for commit)
/// - records start/end instants per invocation
/// - optionally forces an exit code for chosen stages without running them.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    records: Mutex<Vec<RunRecord>>,
    failures: HashMap<StageName, i32>,
    delay: Option<Duration>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, stage: &str, exit_code: i32) -> Self {
        self.failures.insert(stage.to_string(), exit_code);
        self
    }

    /// Sleep this long before each command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn records(&self) -> Vec<RunRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn ran(&self) -> Vec<StageName> {
        self.records().into_iter().map(|r| r.stage).collect()
    }

    pub fn record_of(&self, stage: &str) -> Option<RunRecord> {
        self.records().into_iter().find(|r| r.stage == stage)
    }
}

impl CommandRunner for RecordingRunner {
    fn run<'a>(
        &'a self,
        stage: &'a str,
        cmd: &'a str,
        cwd: &'a Path,
        params: &'a BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let code = match self.failures.get(stage) {
                Some(code) => *code,
                None => ShellRunner.run(stage, cmd, cwd, params).await?,
            };

            self.records.lock().unwrap().push(RunRecord {
                stage: stage.to_string(),
                started,
                finished: Instant::now(),
            });
            Ok(code)
        })
    }
}

/// A store wrapper that fails every `every`-th metadata call with
/// `LockContention`, simulating other processes holding the lock.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<dyn MetadataStore>,
    every: usize,
    calls: Arc<AtomicUsize>,
    contended: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn MetadataStore>, every: usize) -> Self {
        Self {
            inner,
            every: every.max(1),
            calls: Arc::new(AtomicUsize::new(0)),
            contended: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many calls were failed with `LockContention`.
    pub fn contended(&self) -> usize {
        self.contended.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n % self.every == 0 {
            self.contended.fetch_add(1, Ordering::SeqCst);
            return Err(StagehandError::LockContention(
                self.inner.root().display().to_string(),
            ));
        }
        Ok(())
    }
}

impl MetadataStore for FlakyStore {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    fn dry_run(&self, stage: &Stage) -> Result<Vec<StageName>> {
        self.gate()?;
        self.inner.dry_run(stage)
    }

    fn restore_run_cache(&self, stage: &Stage) -> Result<()> {
        self.gate()?;
        self.inner.restore_run_cache(stage)
    }

    fn commit(&self, stage: &Stage) -> Result<()> {
        self.gate()?;
        self.inner.commit(stage)
    }

    fn open_at(&self, root: &Path) -> Result<Arc<dyn MetadataStore>> {
        Ok(Arc::new(FlakyStore {
            inner: self.inner.open_at(root)?,
            every: self.every,
            calls: self.calls.clone(),
            contended: self.contended.clone(),
        }))
    }
}
