//! Run ledger, resume and stop requests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use waverun::orchestration::RunOptions;
use waverun::{SkipReason, TaskStatus};

use crate::fixtures::{
    engine, fast_options, id, layered_plan, wide_plan, ScriptedExecutor, ScriptedVerifier,
    TestProject,
};

fn resume_options() -> RunOptions {
    RunOptions {
        resume: true,
        cache_enabled: false,
        max_retries: 0,
        ..fast_options()
    }
}

/// Test: Resume after a failed run
/// Given a run that failed at 2.1 and aborted
/// When the plan is rerun with resume once the failure is fixed
/// Then wave 1 is skipped as resumed and only 2.1 and 3.1 execute
#[tokio::test]
async fn test_resume_skips_completed_tasks() {
    let project = TestProject::new();
    let ledger = project.ledger();

    let broken = Arc::new(ScriptedVerifier::new().always_fail("check 2.1", "AssertionError"));
    let first_executor = Arc::new(ScriptedExecutor::new());
    let first = engine(&project.path, &first_executor, &broken)
        .with_ledger(Arc::clone(&ledger))
        .run(layered_plan(), resume_options(), CancellationToken::new())
        .await
        .unwrap();
    assert!(first.aborted);

    let resume = ledger.resume_point().unwrap().unwrap();
    assert_eq!(resume.next_pending, Some(id("2.1")));
    assert!(resume.failure_reason.unwrap().starts_with("2.1"));

    let fixed = Arc::new(ScriptedVerifier::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let second = engine(&project.path, &executor, &fixed)
        .with_ledger(Arc::clone(&ledger))
        .run(layered_plan(), resume_options(), CancellationToken::new())
        .await
        .unwrap();

    assert!(second.is_success());
    assert_eq!(executor.calls(), vec![id("2.1"), id("3.1")]);
    let resumed = TaskStatus::Skipped {
        reason: SkipReason::Resumed,
    };
    assert_eq!(second.execution(&id("1.1")).unwrap().status, resumed);
    assert_eq!(second.execution(&id("1.2")).unwrap().status, resumed);

    let resume = ledger.resume_point().unwrap().unwrap();
    assert_eq!(resume.next_pending, None);
    assert_eq!(resume.checkpoint, "wave-3");
}

/// Test: Without resume, completed work runs again
#[tokio::test]
async fn test_rerun_without_resume_executes_everything() {
    let project = TestProject::new();
    let ledger = project.ledger();
    let verifier = Arc::new(ScriptedVerifier::new());
    let options = RunOptions {
        resume: false,
        ..resume_options()
    };

    for _ in 0..2 {
        let executor = Arc::new(ScriptedExecutor::new());
        engine(&project.path, &executor, &verifier)
            .with_ledger(Arc::clone(&ledger))
            .run(layered_plan(), options.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(executor.call_count(), 4);
    }
    assert_eq!(ledger.records().unwrap().len(), 8);
}

/// Test: Status readout
/// Given a run where 1.1 failed and its dependents were blocked
/// When the ledger status is read
/// Then it reports the latest outcome per task and the counts
#[tokio::test]
async fn test_ledger_status_after_failure() {
    let project = TestProject::new();
    let ledger = project.ledger();
    let verifier = Arc::new(ScriptedVerifier::new().always_fail("check 1.1", "SyntaxError"));
    let executor = Arc::new(ScriptedExecutor::new());

    engine(&project.path, &executor, &verifier)
        .with_ledger(Arc::clone(&ledger))
        .run(layered_plan(), resume_options(), CancellationToken::new())
        .await
        .unwrap();

    let status = ledger.status().unwrap();
    assert_eq!(status.total_records, 4);
    assert_eq!(status.tasks[&id("1.1")], TaskStatus::Failed);
    assert_eq!(status.tasks[&id("1.2")], TaskStatus::Succeeded);
    assert_eq!(status.counts.failed, 1);
    assert_eq!(status.counts.succeeded, 1);
    assert_eq!(status.counts.skipped, 2);
    assert!(ledger.completed_tasks().unwrap().contains(&id("1.2")));
}

/// Test: Reset forgets completed work
#[tokio::test]
async fn test_reset_clears_resume_state() {
    let project = TestProject::new();
    let ledger = project.ledger();
    let verifier = Arc::new(ScriptedVerifier::new());

    let executor = Arc::new(ScriptedExecutor::new());
    engine(&project.path, &executor, &verifier)
        .with_ledger(Arc::clone(&ledger))
        .run(layered_plan(), resume_options(), CancellationToken::new())
        .await
        .unwrap();
    ledger.reset().unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    engine(&project.path, &executor, &verifier)
        .with_ledger(Arc::clone(&ledger))
        .run(layered_plan(), resume_options(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executor.call_count(), 4);
}

/// Test: Stop request before the run
/// Given a cancelled token
/// When the plan runs
/// Then nothing executes and every task is recorded Aborted
#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let project = TestProject::new();
    let ledger = project.ledger();
    let executor = Arc::new(ScriptedExecutor::new());
    let verifier = Arc::new(ScriptedVerifier::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = engine(&project.path, &executor, &verifier)
        .with_ledger(Arc::clone(&ledger))
        .run(layered_plan(), resume_options(), cancel)
        .await
        .unwrap();

    assert!(result.aborted);
    assert_eq!(executor.call_count(), 0);
    assert_eq!(result.executions.len(), 4);
    assert!(result.executions.iter().all(|e| e.status
        == TaskStatus::Skipped {
            reason: SkipReason::Aborted
        }));
    // aborted records do not count as done
    assert!(ledger.completed_tasks().unwrap().is_empty());
}

/// Test: Stop request mid-run
/// Given a slow parallel wave followed by a second wave
/// When the token is cancelled while wave 1 is running
/// Then in-flight tasks finish and the second wave never starts
#[tokio::test]
async fn test_cancel_mid_run_drains_current_wave() {
    let project = TestProject::new();
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(80)));
    let verifier = Arc::new(ScriptedVerifier::new());
    let mut tasks = wide_plan(2);
    tasks.push(crate::fixtures::task("2.1", &["summary.txt", "out_1.txt"]));
    let options = RunOptions {
        concurrency: 2,
        ..resume_options()
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = engine(&project.path, &executor, &verifier)
        .run(tasks, options, cancel)
        .await
        .unwrap();

    assert!(result.aborted);
    assert_eq!(executor.calls_for("1.1"), 1);
    assert_eq!(executor.calls_for("1.2"), 1);
    assert_eq!(executor.calls_for("2.1"), 0);
    assert_eq!(
        result.execution(&id("2.1")).unwrap().status,
        TaskStatus::Skipped {
            reason: SkipReason::Aborted
        }
    );
}
