// src/exec/mod.rs

//! Stage execution layer.
//!
//! - [`retry`] implements the locked retry protocol around repository
//!   mutations.
//! - [`runner`] runs stage commands with `tokio::process::Command`.
//! - [`executor`] brings one stage up to date (dry run, run-cache restore,
//!   execute, commit).
//! - [`pool`] is the local worker pool that the submitter hands stages to.

pub mod executor;
pub mod pool;
pub mod retry;
pub mod runner;

pub use executor::{StageExecutor, StageOutcome, StageReport};
pub use pool::{TaskHandle, TaskResult, WorkerPool};
pub use retry::{RetryPolicy, offload, run_locked};
pub use runner::{CommandRunner, ShellRunner};
