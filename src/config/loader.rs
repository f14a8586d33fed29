// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{PipelineFile, RawPipelineFile, Settings};
use crate::errors::Result;

/// Name of the pipeline manifest at the workspace root.
pub const PIPELINE_FILE: &str = "pipeline.toml";

/// Name of the metadata directory at the workspace root.
pub const META_DIR: &str = ".stagehand";

/// Name of the settings file inside [`META_DIR`].
pub const SETTINGS_FILE: &str = "config.toml";

/// Load a pipeline manifest from a given path and return the raw
/// `RawPipelineFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (DAG correctness, etc.). Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPipelineFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let manifest: RawPipelineFile = toml::from_str(&contents)?;

    Ok(manifest)
}

/// Load a pipeline manifest from path and run validation.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks for unknown `after` references, duplicate outputs and cycles.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<PipelineFile> {
    let raw = load_from_path(&path)?;
    let manifest = PipelineFile::try_from(raw)?;
    Ok(manifest)
}

/// `<root>/pipeline.toml`.
pub fn pipeline_path(root: &Path) -> PathBuf {
    root.join(PIPELINE_FILE)
}

/// `<root>/.stagehand/config.toml`.
pub fn settings_path(root: &Path) -> PathBuf {
    root.join(META_DIR).join(SETTINGS_FILE)
}

/// Load repository settings for the workspace at `root`.
///
/// A missing settings file yields the defaults, so a workspace that was never
/// initialised still behaves sensibly.
pub fn load_settings(root: &Path) -> Result<Settings> {
    let path = settings_path(root);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let contents = fs::read_to_string(&path)?;
    let settings: Settings = toml::from_str(&contents)?;
    settings.validate()?;
    Ok(settings)
}

/// Persist repository settings for the workspace at `root`.
pub fn save_settings(root: &Path, settings: &Settings) -> Result<()> {
    let path = settings_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = toml::to_string(settings)?;
    fs::write(&path, text)?;
    Ok(())
}
