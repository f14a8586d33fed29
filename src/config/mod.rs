// src/config/mod.rs

//! Configuration loading and validation for stagehand.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`): the pipeline manifest
//!   and the repository settings.
//! - Load both from disk (`loader.rs`).
//! - Validate basic invariants like DAG correctness (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{
    META_DIR, PIPELINE_FILE, load_and_validate, load_from_path, load_settings, pipeline_path,
    save_settings,
};
pub use model::{
    CoreSection, ExecSection, PipelineFile, QueueSection, RawPipelineFile, Settings, StageConfig,
};
