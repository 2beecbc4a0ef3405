//! Wave layering of a validated [`TaskDAG`].

use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::dag::TaskDAG;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// A set of mutually independent tasks that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// 1-based position in the run.
    pub number: usize,
    /// Task ids in plan order.
    pub task_ids: Vec<TaskId>,
}

impl Wave {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }
}

/// Partition the DAG into waves with Kahn's algorithm.
///
/// Every task lands in the earliest wave where all of its dependencies have
/// already been placed. Order inside a wave follows the plan.
///
/// Acyclicity is re-checked here: if nodes remain unplaced when no
/// in-degree-zero node is left, the result is `CircularDependency`.
pub fn layer(dag: &TaskDAG) -> Result<Vec<Wave>> {
    let graph = dag.graph();
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.edges_directed(n, Direction::Incoming).count())
        .collect();

    let mut current: Vec<_> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .collect();
    let mut waves = Vec::new();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &node in &current {
            for edge in graph.edges_directed(node, Direction::Outgoing) {
                let target = edge.target();
                in_degree[target.index()] -= 1;
                if in_degree[target.index()] == 0 {
                    next.push(target);
                }
            }
        }
        next.sort();

        waves.push(Wave {
            number: waves.len() + 1,
            task_ids: current.iter().map(|&n| graph[n].id.clone()).collect(),
        });
        current = next;
    }

    if placed < graph.node_count() {
        let cycle = dag.find_cycle().unwrap_or_else(|| {
            graph
                .node_indices()
                .filter(|n| in_degree[n.index()] > 0)
                .map(|n| graph[n].id.clone())
                .collect()
        });
        return Err(Error::CircularDependency { cycle });
    }

    Ok(waves)
}
