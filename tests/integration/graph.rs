//! Graph construction and layering through the public engine API.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use waverun::core::layer;
use waverun::{Error, TaskDAG};

use crate::fixtures::{engine, fast_options, id, layered_plan, task, ScriptedExecutor, ScriptedVerifier, TestProject};

/// Test: Consumer lands one wave after its producer
/// Given A produces a.py and B reads a.py
/// When the graph is layered
/// Then the waves are [[A], [B]]
#[test]
fn test_producer_consumer_waves() {
    let tasks = vec![task("1.1", &["a.py"]), task("1.2", &["b.py", "a.py"])];

    let dag = TaskDAG::build(&tasks).unwrap();
    let waves = layer(&dag).unwrap();

    assert_eq!(waves.len(), 2);
    assert_eq!(waves[0].task_ids, vec![id("1.1")]);
    assert_eq!(waves[1].task_ids, vec![id("1.2")]);
}

/// Test: Mutual file reads form a cycle
/// Given A and B each read the other's produced file
/// When the engine runs
/// Then it fails with a cycle naming both tasks and executes nothing
#[tokio::test]
async fn test_cycle_rejected_before_dispatch() {
    let project = TestProject::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let verifier = Arc::new(ScriptedVerifier::new());
    let tasks = vec![task("1.1", &["a.py", "b.py"]), task("1.2", &["b.py", "a.py"])];

    let result = engine(&project.path, &executor, &verifier)
        .run(tasks, fast_options(), CancellationToken::new())
        .await;

    match result {
        Err(Error::CircularDependency { cycle }) => {
            assert!(cycle.contains(&id("1.1")));
            assert!(cycle.contains(&id("1.2")));
        }
        other => panic!("Expected CircularDependency, got {:?}", other.map(|r| r.run_id)),
    }
    assert_eq!(executor.call_count(), 0);
}

/// Test: Two producers of one file
/// Given two unrelated tasks both declaring out.py as their output
/// When the graph is built
/// Then it fails with DuplicateProducer naming both in plan order
#[test]
fn test_duplicate_producer_rejected() {
    let tasks = vec![task("1.1", &["out.py"]), task("2.1", &["out.py", "x.py"])];

    let err = TaskDAG::build(&tasks).unwrap_err();

    match err {
        Error::DuplicateProducer { file, first, second } => {
            assert_eq!(file, "out.py");
            assert_eq!(first, id("1.1"));
            assert_eq!(second, id("2.1"));
        }
        other => panic!("Expected DuplicateProducer, got {}", other),
    }
}

/// Test: Explicit dependency on a missing task
/// Given a task listing an id that is not in the plan
/// When the graph is built
/// Then it fails with UnknownDependency
#[test]
fn test_unknown_explicit_dependency() {
    let tasks = vec![task("1.1", &["a.py"]).with_dependency(id("9.9"))];

    let err = TaskDAG::build(&tasks).unwrap_err();

    assert!(matches!(err, Error::UnknownDependency { .. }));
    assert!(err.is_graph_error());
}

/// Test: Wave numbers follow the longest dependency chain
/// Given a plan mixing file edges and an explicit edge
/// When the graph is layered
/// Then every task's wave is one past its deepest dependency
#[test]
fn test_wave_is_one_past_deepest_dependency() {
    let mut tasks = layered_plan();
    tasks.push(task("4.1", &["release.txt"]).with_dependency(id("1.2")));

    let dag = TaskDAG::build(&tasks).unwrap();
    let waves = layer(&dag).unwrap();

    let wave_of: HashMap<_, _> = waves
        .iter()
        .flat_map(|w| w.task_ids.iter().map(move |t| (t.clone(), w.number)))
        .collect();
    for t in &tasks {
        let expected = dag
            .dependencies(&t.id)
            .into_iter()
            .map(|d| wave_of[d])
            .max()
            .map_or(1, |deepest| deepest + 1);
        assert_eq!(wave_of[&t.id], expected, "wave of {}", t.id);
    }
    assert_eq!(wave_of[&id("4.1")], 2);
    assert_eq!(wave_of[&id("3.1")], 3);
}

/// Test: describe lists every task with its dependencies
#[test]
fn test_describe_lists_edges() {
    let dag = TaskDAG::build(&layered_plan()).unwrap();

    let text = dag.describe();

    assert!(text.starts_with("Task Dependency Graph:"));
    assert!(text.contains("2.1 (task 2.1)"));
    assert!(text.contains("depends on: 1.1"));
}
