// src/engine/mod.rs

//! Orchestration engine for stagehand.
//!
//! [`pipeline`] turns a stage graph into submitted tasks on the worker pool
//! and, for isolated runs, consolidates results into the primary workspace.
//! [`aggregator`] waits on the submitted tasks and builds the run summary.

pub mod aggregator;
pub mod pipeline;

pub use aggregator::{RunSummary, wait_all};
pub use pipeline::{ReproOptions, reproduce, reproduce_with};
