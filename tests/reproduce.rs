mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stagehand::dag::{GraphSource, ManifestSource};
use stagehand::engine::{reproduce, reproduce_with};
use stagehand::errors::StagehandError;
use stagehand::exec::{RetryPolicy, StageOutcome};
use stagehand::store::{MetadataStore, RepoLock, run_key};
use stagehand::types::FailurePolicy;

use common::{
    FlakyStore, PipelineBuilder, RecordingRunner, StageBuilder, TestWorkspace, init_tracing,
    ml_pipeline, runner, test_options, with_timeout,
};

#[tokio::test]
async fn first_run_executes_everything_in_order() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(ml_pipeline());
    ws.write("raw.txt", "hello");
    let runner = runner();

    let summary = with_timeout(reproduce(ws.path(), &test_options(), runner.clone()))
        .await
        .unwrap();

    assert!(summary.all_succeeded());
    assert_eq!(summary.executed(), vec!["prepare", "train", "evaluate"]);
    assert_eq!(runner.ran(), vec!["prepare", "train", "evaluate"]);
    assert_eq!(ws.read("data/clean.txt"), "HELLO");
    assert_eq!(ws.read("metrics.txt").trim(), "5");
}

#[tokio::test]
async fn second_run_without_changes_runs_no_commands() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(ml_pipeline());
    ws.write("raw.txt", "hello");
    reproduce(ws.path(), &test_options(), runner()).await.unwrap();

    let second = runner();
    let summary = with_timeout(reproduce(ws.path(), &test_options(), second.clone()))
        .await
        .unwrap();

    assert_eq!(second.calls(), 0);
    assert!(summary.executed().is_empty());
    assert_eq!(summary.reports.len(), 3);
    for report in summary.reports.iter() {
        assert!(
            matches!(report.outcome, StageOutcome::Skipped | StageOutcome::CacheHit),
            "{} was {}",
            report.stage,
            report.outcome
        );
    }
}

#[tokio::test]
async fn reverted_inputs_are_restored_from_run_cache() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(ml_pipeline());

    ws.write("raw.txt", "hello");
    reproduce(ws.path(), &test_options(), runner()).await.unwrap();

    ws.write("raw.txt", "abc");
    let changed = reproduce(ws.path(), &test_options(), runner()).await.unwrap();
    assert_eq!(changed.executed(), vec!["prepare", "train", "evaluate"]);
    assert_eq!(ws.read("metrics.txt").trim(), "3");

    ws.write("raw.txt", "hello");
    let third = runner();
    let summary = with_timeout(reproduce(ws.path(), &test_options(), third.clone()))
        .await
        .unwrap();

    assert_eq!(third.calls(), 0);
    assert_eq!(summary.cache_hits(), vec!["prepare", "train", "evaluate"]);
    assert_eq!(summary.outcome("train"), Some(StageOutcome::CacheHit));
    assert_eq!(ws.read("metrics.txt").trim(), "5");
}

#[tokio::test]
async fn deleted_outputs_come_back_without_running() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(ml_pipeline());
    ws.write("raw.txt", "hello");
    reproduce(ws.path(), &test_options(), runner()).await.unwrap();

    std::fs::remove_file(ws.path().join("model.txt")).unwrap();
    let again = runner();
    let summary = reproduce(ws.path(), &test_options(), again.clone())
        .await
        .unwrap();

    assert_eq!(again.calls(), 0);
    assert_eq!(summary.outcome("prepare"), Some(StageOutcome::Skipped));
    assert_eq!(summary.outcome("train"), Some(StageOutcome::CacheHit));
    assert_eq!(ws.read("model.txt").trim(), "5");
}

#[tokio::test]
async fn force_reruns_and_overwrites_the_cache_entry() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(
        PipelineBuilder::new().with_stage("stamp", StageBuilder::new("echo $$ > stamp.txt").out("stamp.txt").build()),
    );

    reproduce(ws.path(), &test_options(), runner()).await.unwrap();

    let graph = ManifestSource.load(ws.path()).unwrap();
    let stage = graph.stage("stamp").unwrap().clone();
    let key = run_key(&stage.definition_hash, &BTreeMap::new());
    let repo = ws.repo();
    let before = repo.runs().get(&key).unwrap().unwrap();

    let unforced = runner();
    let summary = reproduce(ws.path(), &test_options(), unforced.clone()).await.unwrap();
    assert_eq!(unforced.calls(), 0);
    assert_eq!(summary.skipped(), vec!["stamp"]);

    let forced = runner();
    let options = stagehand::engine::ReproOptions {
        force: true,
        ..test_options()
    };
    let summary = reproduce(ws.path(), &options, forced.clone()).await.unwrap();
    assert_eq!(forced.calls(), 1);
    assert_eq!(summary.executed(), vec!["stamp"]);

    let after = repo.runs().get(&key).unwrap().unwrap();
    assert_ne!(before.outs["stamp.txt"].hash, after.outs["stamp.txt"].hash);
    assert_eq!(
        repo.read_stages_lock().unwrap().get("stamp"),
        Some(&after)
    );
}

#[tokio::test]
async fn params_reach_the_command_environment() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(PipelineBuilder::new().with_stage(
        "train",
        StageBuilder::new("echo \"$STAGEHAND_STAGE:$STAGEHAND_PARAM_EPOCHS\" > epochs.txt")
            .out("epochs.txt")
            .param("epochs", "3")
            .build(),
    ));

    reproduce(ws.path(), &test_options(), runner()).await.unwrap();
    assert_eq!(ws.read("epochs.txt").trim(), "train:3");
}

#[tokio::test]
async fn no_stage_starts_before_its_predecessors_finish() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(
        PipelineBuilder::new()
            .with_stage("a", StageBuilder::new("true").build())
            .with_stage("b", StageBuilder::new("true").after("a").build())
            .with_stage("c", StageBuilder::new("true").after("a").build())
            .with_stage("d", StageBuilder::new("true").after("b").after("c").build()),
    );
    let runner = Arc::new(RecordingRunner::new().with_delay(Duration::from_millis(20)));

    let summary = with_timeout(reproduce(ws.path(), &test_options(), runner.clone()))
        .await
        .unwrap();
    assert!(summary.all_succeeded());
    assert_eq!(runner.calls(), 4);

    for (pred, succ) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
        let pred = runner.record_of(pred).unwrap();
        let succ = runner.record_of(succ).unwrap();
        assert!(
            pred.finished <= succ.started,
            "{} started before {} finished",
            succ.stage,
            pred.stage
        );
    }
}

#[tokio::test]
async fn failures_are_collected_and_independent_stages_finish() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(
        PipelineBuilder::new()
            .with_stage("bad", StageBuilder::new("exit 3").build())
            .with_stage("child", StageBuilder::new("true").after("bad").build())
            .with_stage("sibling", StageBuilder::new("echo ok > ok.txt").out("ok.txt").build()),
    );
    let runner = runner();

    let summary = reproduce(ws.path(), &test_options(), runner.clone())
        .await
        .unwrap();

    assert_eq!(summary.executed(), vec!["sibling"]);
    let mut failed = summary.failed();
    failed.sort();
    assert_eq!(failed, vec!["bad", "child"]);
    assert!(!runner.ran().contains(&"child".to_string()));

    let (stage, err) = summary.first_failure().unwrap();
    assert_eq!(stage, "bad");
    assert!(matches!(
        err.as_ref(),
        StagehandError::StageExecutionFailed { exit_code: 3, .. }
    ));
    let child_err = &summary.failed.iter().find(|(n, _)| n == "child").unwrap().1;
    assert!(matches!(child_err.as_ref(), StagehandError::UpstreamFailed { .. }));
    assert!(summary.to_string().contains("bad"));
}

#[tokio::test]
async fn fail_fast_stops_waiting_at_the_first_failure() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(
        PipelineBuilder::new()
            .with_stage("bad", StageBuilder::new("exit 1").build())
            .with_stage("slow", StageBuilder::new("sleep 2").build()),
    );
    let options = stagehand::engine::ReproOptions {
        failure_policy: FailurePolicy::FailFast,
        ..test_options()
    };

    let summary = with_timeout(reproduce(ws.path(), &options, runner()))
        .await
        .unwrap();

    assert_eq!(summary.failed(), vec!["bad"]);
    assert_eq!(summary.abandoned, vec!["slow".to_string()]);
    assert!(!summary.all_succeeded());
}

#[tokio::test]
async fn independent_stages_survive_interleaved_lock_contention() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(
        PipelineBuilder::new()
            .with_stage("left", StageBuilder::new("echo l > left.txt").out("left.txt").build())
            .with_stage("right", StageBuilder::new("echo r > right.txt").out("right.txt").build()),
    );
    let store = Arc::new(FlakyStore::new(Arc::new(ws.repo()), 2));

    let summary = with_timeout(reproduce_with(store.clone(), &test_options(), runner()))
        .await
        .unwrap();

    assert!(summary.all_succeeded(), "{summary}");
    let mut executed = summary.executed();
    executed.sort();
    assert_eq!(executed, vec!["left", "right"]);
    assert!(store.contended() >= 1);

    let lock = ws.repo().read_stages_lock().unwrap();
    assert!(lock.get("left").is_some());
    assert!(lock.get("right").is_some());
}

#[tokio::test]
async fn held_lock_exhausts_the_retry_budget() {
    init_tracing();
    let ws = TestWorkspace::with_pipeline(
        PipelineBuilder::new().with_stage("only", StageBuilder::new("true").build()),
    );
    let repo = ws.repo();
    let _held = RepoLock::acquire(repo.meta_dir()).unwrap();
    assert!(repo.is_locked());

    let options = stagehand::engine::ReproOptions {
        retry: RetryPolicy::without_jitter(5),
        ..test_options()
    };
    let runner = runner();
    let summary = with_timeout(reproduce(ws.path(), &options, runner.clone()))
        .await
        .unwrap();

    assert_eq!(runner.calls(), 0);
    let (_, err) = summary.first_failure().unwrap();
    assert!(matches!(
        err.as_ref(),
        StagehandError::LockAcquisitionFailed { attempts: 5, .. }
    ));
}

#[tokio::test]
async fn unknown_target_is_reported_before_anything_runs() {
    let ws = TestWorkspace::with_pipeline(ml_pipeline());
    ws.write("raw.txt", "hello");
    let options = stagehand::engine::ReproOptions {
        targets: vec!["ghost".to_string()],
        ..test_options()
    };
    let runner = runner();

    let err = reproduce(ws.path(), &options, runner.clone()).await.unwrap_err();
    assert!(matches!(err, StagehandError::StageNotFound(ref s) if s == "ghost"));
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn targets_only_run_their_ancestors() {
    let ws = TestWorkspace::with_pipeline(ml_pipeline());
    ws.write("raw.txt", "hello");
    let options = stagehand::engine::ReproOptions {
        targets: vec!["train".to_string()],
        ..test_options()
    };
    let runner = runner();

    let summary = reproduce(ws.path(), &options, runner.clone()).await.unwrap();
    assert_eq!(summary.executed(), vec!["prepare", "train"]);
    assert!(!ws.exists("metrics.txt"));
}

#[tokio::test]
async fn empty_pipeline_is_a_successful_no_op() {
    let ws = TestWorkspace::new();
    ws.write("pipeline.toml", "");
    let runner = runner();

    let summary = reproduce(ws.path(), &test_options(), runner.clone()).await.unwrap();
    assert!(summary.is_empty());
    assert!(summary.all_succeeded());
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn dot_source_drives_the_run() {
    init_tracing();
    let ws = TestWorkspace::new();
    ws.write(
        "graph.dot",
        r#"strict digraph {
"fetch" [cmd="echo fetched > fetched.txt"];
"raw";
"train" [cmd="cat fetched.txt > trained.txt"];
"fetch" -> "raw";
"raw" -> "train";
"\n";
}
"#,
    );
    let options = stagehand::engine::ReproOptions {
        source_cmd: Some("cat graph.dot".to_string()),
        ..test_options()
    };
    let runner = runner();

    let summary = with_timeout(reproduce(ws.path(), &options, runner.clone()))
        .await
        .unwrap();

    assert_eq!(summary.executed(), vec!["fetch", "train"]);
    assert_eq!(runner.ran(), vec!["fetch", "train"]);
    assert_eq!(ws.read("trained.txt").trim(), "fetched");
}
