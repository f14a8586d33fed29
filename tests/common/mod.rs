#![allow(dead_code)]

use std::sync::Arc;

use stagehand::engine::ReproOptions;
use stagehand::exec::RetryPolicy;

pub use stagehand_test_utils::builders::{PipelineBuilder, StageBuilder, TestWorkspace, graph};
pub use stagehand_test_utils::fakes::{FlakyStore, RecordingRunner, RecordingSubmitter};
pub use stagehand_test_utils::{init_tracing, with_timeout};

/// Reproduce options for tests: a few workers, fast retries.
pub fn test_options() -> ReproOptions {
    ReproOptions {
        workers: 4,
        retry: RetryPolicy::without_jitter(200),
        ..ReproOptions::default()
    }
}

pub fn runner() -> Arc<RecordingRunner> {
    Arc::new(RecordingRunner::new())
}

/// `prepare -> train -> evaluate` over real files.
pub fn ml_pipeline() -> PipelineBuilder {
    PipelineBuilder::new()
        .with_stage(
            "prepare",
            StageBuilder::new("mkdir -p data && tr a-z A-Z < raw.txt > data/clean.txt")
                .dep("raw.txt")
                .out("data/clean.txt")
                .build(),
        )
        .with_stage(
            "train",
            StageBuilder::new("wc -c < data/clean.txt > model.txt")
                .dep("data/clean.txt")
                .out("model.txt")
                .build(),
        )
        .with_stage(
            "evaluate",
            StageBuilder::new("cat model.txt > metrics.txt")
                .dep("model.txt")
                .out("metrics.txt")
                .build(),
        )
}
