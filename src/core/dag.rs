//! Task DAG for the tasks of a single phase.
//!
//! Tasks of a phase may wait on sibling tasks (their outputs become context
//! for the waiting task). The DAG lets the orchestrator dispatch every task
//! whose siblings are done as one concurrent wave.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// Dependency graph over the tasks of one phase.
///
/// An edge `a -> b` means `b` waits for `a`.
pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
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

    /// Build a DAG from a phase's task list, wiring each task's `after` list.
    ///
    /// # Errors
    /// Returns an error if a task waits for a task outside the list, or if
    /// the declared waits form a cycle.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();
        let waits: Vec<(TaskId, Vec<TaskId>)> =
            tasks.iter().map(|t| (t.id, t.after.clone())).collect();

        for task in tasks {
            dag.add_task(task);
        }
        for (task, siblings) in waits {
            for sibling in siblings {
                dag.add_dependency(&sibling, &task)?;
            }
        }
        Ok(dag)
    }

    /// Add a task to the DAG. Adding a task that is already present is a no-op.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `to` waits for `from`.
    ///
    /// # Errors
    /// Returns an error if either task is missing or the edge closes a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::TaskGraph(format!("Task {} not found in phase", from)))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::TaskGraph(format!("Task {} not found in phase", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::TaskGraph(format!(
                "Task {} waiting for {} would create a cycle",
                to, from
            )));
        }

        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Tasks not yet settled whose siblings are all settled.
    ///
    /// Ordered by descending priority, then by insertion order, so the
    /// semaphore hands permits to urgent work first.
    pub fn ready_tasks<'a>(&'a self, settled: &HashSet<TaskId>) -> Vec<&'a Task> {
        let mut ready: Vec<(NodeIndex, &Task)> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if settled.contains(&task.id) {
                    return None;
                }
                let deps_settled = self
                    .graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| settled.contains(&d.id))
                            .unwrap_or(false)
                    });
                deps_settled.then_some((index, task))
            })
            .collect();

        ready.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        ready.into_iter().map(|(_, task)| task).collect()
    }

    /// Check if every task is in the settled set.
    pub fn all_settled(&self, settled: &HashSet<TaskId>) -> bool {
        self.task_index.keys().all(|id| settled.contains(id))
    }

    /// Tasks in an order where every task follows the siblings it waits for.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::TaskGraph(format!("Cycle detected at task: {}", id))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
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
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
