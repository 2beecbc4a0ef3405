//! Result cache behaviour across runs.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use waverun::orchestration::{PlannedAction, RunOptions};
use waverun::{SkipReason, TaskStatus};

use crate::fixtures::{
    engine, fast_options, id, layered_plan, ScriptedExecutor, ScriptedVerifier, TestProject,
};

fn cached() -> TaskStatus {
    TaskStatus::Skipped {
        reason: SkipReason::Cached,
    }
}

/// Test: Cache idempotence
/// Given a plan that ran to completion once
/// When the same plan runs again with unchanged files
/// Then the executor is never called and every task is replayed from cache
#[tokio::test]
async fn test_second_run_is_fully_cached() {
    let project = TestProject::new();
    project.write("schema.sql", "create table users;");
    let cache = project.cache();

    let first_executor = Arc::new(ScriptedExecutor::new());
    let verifier = Arc::new(ScriptedVerifier::new());
    let first = engine(&project.path, &first_executor, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.succeeded, 4);
    assert_eq!(first_executor.call_count(), 4);
    assert_eq!(cache.len(), 4);

    let second_executor = Arc::new(ScriptedExecutor::new());
    let second = engine(&project.path, &second_executor, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second_executor.call_count(), 0);
    assert!(second.is_success());
    assert_eq!(second.skipped, 4);
    for execution in &second.executions {
        assert_eq!(execution.status, cached());
        assert_eq!(execution.attempts, 0);
    }
}

/// Test: Changed input reruns its readers only
/// Given a fully cached plan
/// When schema.sql, read only by 1.1, changes
/// Then 1.1 and the tasks fed by its output rerun, 1.2 stays cached
#[tokio::test]
async fn test_changed_input_invalidates_readers() {
    let project = TestProject::new();
    project.write("schema.sql", "create table users;");
    let cache = project.cache();
    let verifier = Arc::new(ScriptedVerifier::new());

    let warmup = Arc::new(ScriptedExecutor::new());
    engine(&project.path, &warmup, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();

    project.write("schema.sql", "create table accounts;");
    let executor = Arc::new(ScriptedExecutor::new());
    let result = engine(&project.path, &executor, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.calls(), vec![id("1.1"), id("2.1"), id("3.1")]);
    assert_eq!(result.execution(&id("1.2")).unwrap().status, cached());
    assert!(project.read("test_api.py").contains("create table accounts;"));
}

/// Test: Deleted output is restored on replay
/// Given a fully cached plan
/// When models.py, produced by 1.1, is deleted before the next run
/// Then 1.1 replays from cache with models.py written back, and nothing reruns
#[tokio::test]
async fn test_cached_task_restores_deleted_output() {
    let project = TestProject::new();
    project.write("schema.sql", "create table users;");
    let cache = project.cache();
    let verifier = Arc::new(ScriptedVerifier::new());

    let warmup = Arc::new(ScriptedExecutor::new());
    engine(&project.path, &warmup, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();
    let original = project.read("models.py");
    std::fs::remove_file(project.path.join("models.py")).unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let result = engine(&project.path, &executor, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.call_count(), 0);
    assert_eq!(result.execution(&id("1.1")).unwrap().status, cached());
    assert_eq!(project.read("models.py"), original);
}

/// Test: Force bypasses lookups but refreshes entries
/// Given a fully cached plan
/// When it runs with force, then again without
/// Then the forced run executes everything and the next run is cached
#[tokio::test]
async fn test_force_reruns_and_restores() {
    let project = TestProject::new();
    let cache = project.cache();
    let verifier = Arc::new(ScriptedVerifier::new());

    let warmup = Arc::new(ScriptedExecutor::new());
    engine(&project.path, &warmup, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();

    let forced = Arc::new(ScriptedExecutor::new());
    let options = RunOptions {
        force: true,
        ..fast_options()
    };
    engine(&project.path, &forced, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), options, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(forced.call_count(), 4);

    let after = Arc::new(ScriptedExecutor::new());
    engine(&project.path, &after, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), fast_options(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(after.call_count(), 0);
}

/// Test: Disabled cache neither reads nor writes
#[tokio::test]
async fn test_cache_disabled() {
    let project = TestProject::new();
    let cache = project.cache();
    let executor = Arc::new(ScriptedExecutor::new());
    let verifier = Arc::new(ScriptedVerifier::new());
    let options = RunOptions {
        cache_enabled: false,
        ..fast_options()
    };

    engine(&project.path, &executor, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(layered_plan(), options, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.call_count(), 4);
    assert!(cache.is_empty());
}

/// Test: Failures are never cached
/// Given a task that fails every attempt
/// When the plan runs twice
/// Then the task is executed on both runs
#[tokio::test]
async fn test_failures_are_not_cached() {
    let project = TestProject::new();
    let cache = project.cache();
    let verifier =
        Arc::new(ScriptedVerifier::new().always_fail("check 1.2", "AssertionError"));
    let options = RunOptions {
        max_retries: 0,
        continue_on_failure: true,
        ..fast_options()
    };

    for _ in 0..2 {
        let executor = Arc::new(ScriptedExecutor::new());
        engine(&project.path, &executor, &verifier)
            .with_cache(Arc::clone(&cache))
            .run(layered_plan(), options.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(executor.calls_for("1.2"), 1);
    }
}

/// Test: Dry run accounting
/// Given a plan whose first wave is cached
/// When a dry run is requested
/// Then cached tasks report Cached, the rest Run, and nothing executes
#[tokio::test]
async fn test_dry_run_reports_without_executing() {
    let project = TestProject::new();
    let cache = project.cache();
    let verifier = Arc::new(ScriptedVerifier::new());
    let wave_one = layered_plan().into_iter().take(2).collect();

    let warmup = Arc::new(ScriptedExecutor::new());
    engine(&project.path, &warmup, &verifier)
        .with_cache(Arc::clone(&cache))
        .run(wave_one, fast_options(), CancellationToken::new())
        .await
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let report = engine(&project.path, &executor, &verifier)
        .with_cache(Arc::clone(&cache))
        .dry_run(layered_plan(), &fast_options())
        .await
        .unwrap();

    assert_eq!(executor.call_count(), 0);
    assert_eq!(report.waves.len(), 3);
    assert_eq!(report.count(PlannedAction::Cached), 2);
    assert_eq!(report.count(PlannedAction::Run), 2);
}
