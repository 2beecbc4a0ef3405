//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Edges point from a producer to its consumer. They come from two sources:
//! explicit `depends_on` ids, and file inference (a task that lists another
//! task's produced file as an input depends on that task). Building the DAG
//! validates that every produced file has a single owner and that the edge
//! set is acyclic.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Why one task depends on another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyType {
    /// Declared by id in the consumer's `depends_on`.
    Explicit,
    /// The consumer reads a file the producer writes.
    File {
        /// The produced file that links the two tasks.
        file: String,
    },
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Explicit => write!(f, "explicit"),
            DependencyType::File { file } => write!(f, "file: {}", file),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// The task dependency graph.
///
/// Nodes are tasks in plan order (node index == insertion order), edges
/// run producer -> consumer and carry the [`DependencyType`].
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Arc<Task>, DependencyType>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build and validate the graph for a task list.
    ///
    /// # Errors
    /// - `DuplicateTaskId` if two tasks share an id
    /// - `DuplicateProducer` if two tasks produce the same file
    /// - `UnknownDependency` if `depends_on` names a task not in the list
    /// - `CircularDependency` with the full cycle path if the edges loop
    pub fn build(tasks: &[Task]) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            if dag.contains_task(&task.id) {
                return Err(Error::DuplicateTaskId(task.id.clone()));
            }
            dag.add_task(task.clone());
        }

        let mut producers: HashMap<&str, &TaskId> = HashMap::new();
        for task in tasks {
            if let Some(file) = task.produces.as_deref() {
                if let Some(first) = producers.insert(file, &task.id) {
                    return Err(Error::DuplicateProducer {
                        file: file.to_string(),
                        first: first.clone(),
                        second: task.id.clone(),
                    });
                }
            }
        }

        for task in tasks {
            // Explicit edges go in first so they win over inference for the same pair.
            for dep in &task.depends_on {
                if !dag.contains_task(dep) {
                    return Err(Error::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dag.add_dependency(dep, &task.id, DependencyType::Explicit)?;
            }
            for input in &task.inputs {
                let Some(&producer) = producers.get(input.as_str()) else {
                    continue;
                };
                if producer == &task.id {
                    continue;
                }
                dag.add_dependency(
                    producer,
                    &task.id,
                    DependencyType::File {
                        file: input.clone(),
                    },
                )?;
            }
        }

        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::CircularDependency { cycle });
        }

        debug!(
            tasks = dag.task_count(),
            edges = dag.dependency_count(),
            "dependency graph built"
        );
        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// If a task with the same id already exists, returns the existing index.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id.clone();
        let index = self.graph.add_node(Arc::new(task));
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// A second edge for the same pair is merged; an explicit edge replaces
    /// an inferred one. No cycle check happens here, see [`TaskDAG::find_cycle`].
    ///
    /// # Errors
    /// Returns an error if either task is not in the DAG.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        match self.graph.find_edge(from_index, to_index) {
            Some(edge) => {
                if dep_type == DependencyType::Explicit {
                    if let Some(weight) = self.graph.edge_weight_mut(edge) {
                        *weight = DependencyType::Explicit;
                    }
                }
            }
            None => {
                self.graph.add_edge(from_index, to_index, dep_type);
            }
        }
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", id)))
    }

    fn id_at(&self, index: NodeIndex) -> Option<&TaskId> {
        self.graph.node_weight(index).map(|t| &t.id)
    }

    /// Neighbors in one direction, sorted by plan order.
    fn neighbors_sorted(&self, index: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(index, dir).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Find a dependency cycle, if any.
    ///
    /// Iterative depth-first search with three-color marking. Returns the
    /// cycle as an ordered path whose first and last ids are the same task,
    /// e.g. `[1.1, 1.2, 1.1]`.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::InProgress;
            let mut path = vec![start];
            let mut frames = vec![self
                .neighbors_sorted(start, Direction::Outgoing)
                .into_iter()];

            while let Some(frame) = frames.last_mut() {
                match frame.next() {
                    Some(next) => match marks[next.index()] {
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::InProgress;
                            path.push(next);
                            frames.push(
                                self.neighbors_sorted(next, Direction::Outgoing)
                                    .into_iter(),
                            );
                        }
                        Mark::InProgress => {
                            let pos = path.iter().position(|n| *n == next).unwrap_or(0);
                            let cycle = path[pos..]
                                .iter()
                                .chain(std::iter::once(&next))
                                .filter_map(|n| self.id_at(*n).cloned())
                                .collect();
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    },
                    None => {
                        frames.pop();
                        if let Some(done) = path.pop() {
                            marks[done.index()] = Mark::Done;
                        }
                    }
                }
            }
        }

        None
    }

    /// Get a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Arc<Task>> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if a dependency exists between two tasks.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        self.get_dependency(from, to).is_some()
    }

    /// Get the dependency type between two tasks, if one exists.
    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyType> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge)
    }

    /// Direct dependencies of a task, in plan order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.task_index
            .get(id)
            .map(|&index| {
                self.neighbors_sorted(index, Direction::Incoming)
                    .into_iter()
                    .filter_map(|n| self.id_at(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tasks that directly depend on the given task, in plan order.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.task_index
            .get(id)
            .map(|&index| {
                self.neighbors_sorted(index, Direction::Outgoing)
                    .into_iter()
                    .filter_map(|n| self.id_at(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every task reachable from `id` through dependent edges.
    pub fn transitive_dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(next_id) = self.id_at(next) {
                    if seen.insert(next_id.clone()) {
                        queue.push_back(next);
                    }
                }
            }
        }
        seen
    }

    /// All tasks in plan order.
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.graph.node_weights()
    }

    /// Get the underlying graph for advanced operations.
    pub fn graph(&self) -> &DiGraph<Arc<Task>, DependencyType> {
        &self.graph
    }

    /// Text listing of every task and what it depends on.
    pub fn describe(&self) -> String {
        let mut lines = vec!["Task Dependency Graph:".to_string(), String::new()];
        for task in self.tasks() {
            lines.push(format!("  {} ({})", task.id, task.name));
            let deps = self.dependencies(&task.id);
            if deps.is_empty() {
                lines.push("    -> no dependencies".to_string());
            } else {
                let joined: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
                lines.push(format!("    -> depends on: {}", joined.join(", ")));
            }
        }
        lines.join("\n")
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
