mod common;

use std::collections::BTreeMap;

use stagehand::dag::{GraphSource, ManifestSource};
use stagehand::engine::{ReproOptions, reproduce};
use stagehand::errors::StagehandError;
use stagehand::exec::StageOutcome;
use stagehand::store::run_key;
use stagehand::types::IsolationMode;

use common::{
    PipelineBuilder, StageBuilder, TestWorkspace, init_tracing, ml_pipeline, runner, test_options,
    with_timeout,
};

fn isolated() -> ReproOptions {
    ReproOptions {
        isolation: IsolationMode::PerStage,
        ..test_options()
    }
}

#[tokio::test]
async fn failing_stage_still_removes_its_workspace() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(PipelineBuilder::new().with_stage(
        "boom",
        StageBuilder::new("echo partial > partial.txt; exit 4")
            .out("partial.txt")
            .build(),
    ));

    let summary = with_timeout(reproduce(ws.path(), &isolated(), runner()))
        .await
        .unwrap();

    let (stage, err) = summary.first_failure().unwrap();
    assert_eq!(stage, "boom");
    assert!(matches!(
        err.as_ref(),
        StagehandError::StageExecutionFailed { exit_code: 4, .. }
    ));
    assert!(ws.isolated_workspaces().is_empty());
    assert!(!ws.exists("partial.txt"));
    assert!(!summary.consolidated);
}

#[tokio::test]
async fn per_stage_run_is_consolidated_into_the_primary_workspace() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(ml_pipeline());
    ws.write("raw.txt", "hello");
    let runner = runner();

    let summary = with_timeout(reproduce(ws.path(), &isolated(), runner.clone()))
        .await
        .unwrap();

    assert!(summary.all_succeeded(), "{summary}");
    assert!(summary.consolidated);
    assert_eq!(summary.executed(), vec!["prepare", "train", "evaluate"]);
    // Consolidation restores from the run cache instead of re-running.
    assert_eq!(runner.calls(), 3);
    assert_eq!(ws.read("metrics.txt").trim(), "5");
    assert!(ws.isolated_workspaces().is_empty());

    let again = common::runner();
    let summary = reproduce(ws.path(), &test_options(), again.clone())
        .await
        .unwrap();
    assert_eq!(again.calls(), 0);
    assert!(
        summary
            .reports
            .iter()
            .all(|r| r.outcome == StageOutcome::Skipped)
    );
}

#[tokio::test]
async fn forced_isolated_run_reaches_the_primary_workspace() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(PipelineBuilder::new().with_stage(
        "stamp",
        StageBuilder::new("echo $$ > stamp.txt").out("stamp.txt").build(),
    ));

    reproduce(ws.path(), &test_options(), runner()).await.unwrap();
    let before = ws.read("stamp.txt");
    let repo = ws.repo();
    let locked_before = repo.read_stages_lock().unwrap().get("stamp").cloned().unwrap();

    let forced = runner();
    let options = ReproOptions {
        force: true,
        ..isolated()
    };
    let summary = with_timeout(reproduce(ws.path(), &options, forced.clone()))
        .await
        .unwrap();

    assert!(summary.consolidated, "{summary}");
    assert_eq!(summary.executed(), vec!["stamp"]);
    assert_eq!(forced.calls(), 1);

    let after = ws.read("stamp.txt");
    assert_ne!(before, after);

    let graph = ManifestSource.load(ws.path()).unwrap();
    let stage = graph.stage("stamp").unwrap();
    let key = run_key(&stage.definition_hash, &BTreeMap::new());
    let cached = repo.runs().get(&key).unwrap().unwrap();
    let locked_after = repo.read_stages_lock().unwrap().get("stamp").cloned().unwrap();
    assert_ne!(locked_before, locked_after);
    assert_eq!(locked_after, cached);
}

#[tokio::test]
async fn consolidation_can_be_turned_off() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(ml_pipeline());
    ws.write("raw.txt", "hello");
    let options = ReproOptions {
        consolidate: false,
        ..isolated()
    };

    let summary = reproduce(ws.path(), &options, runner()).await.unwrap();

    assert!(summary.all_succeeded());
    assert!(!summary.consolidated);
    assert!(!ws.exists("metrics.txt"));
}

#[tokio::test]
async fn disabled_cleanup_keeps_workspaces_for_inspection() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(PipelineBuilder::new().with_stage(
        "boom",
        StageBuilder::new("echo partial > partial.txt; exit 1").build(),
    ));
    let options = ReproOptions {
        cleanup: false,
        ..isolated()
    };

    reproduce(ws.path(), &options, runner()).await.unwrap();

    let kept = ws.isolated_workspaces();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].join("partial.txt").exists());
}
