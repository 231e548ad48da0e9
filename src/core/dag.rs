//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! [`TaskGraphBuilder::build`] turns a flat task list into a leveled execution
//! plan. Levels come from Kahn's algorithm: a task sits one level after the
//! deepest of its dependencies, so every task in a level can run concurrently.
//! The resulting [`TaskDAG`] is immutable; a changed task set needs a rebuild.

use crate::core::task::{Task, TaskId, TaskSpec};
use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_error};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// The task dependency graph.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    levels: Vec<Vec<TaskId>>,
    level_of: HashMap<TaskId, usize>,
}

/// Builds [`TaskDAG`]s from task specs, rejecting cycles.
pub struct TaskGraphBuilder;

impl TaskGraphBuilder {
    /// Build a leveled DAG from the given tasks.
    ///
    /// # Errors
    /// - `DuplicateTask` if two specs share an id
    /// - `UnknownDependency` if a dependency names a task not in the batch
    /// - `CircularDependency` naming the tasks of a cycle (self-dependency
    ///   included); no partial DAG is ever returned
    pub fn build(specs: Vec<TaskSpec>) -> Result<TaskDAG> {
        let mut graph: DiGraph<Task, ()> = DiGraph::with_capacity(specs.len(), specs.len());
        let mut task_index: HashMap<TaskId, NodeIndex> = HashMap::with_capacity(specs.len());

        for spec in &specs {
            if task_index.contains_key(&spec.id) {
                return Err(Error::DuplicateTask(spec.id.clone()));
            }
            let index = graph.add_node(Task::from(spec.clone()));
            task_index.insert(spec.id.clone(), index);
        }

        for spec in &specs {
            let to = task_index[&spec.id];
            let mut seen = HashSet::new();
            for dep in &spec.dependencies {
                if !seen.insert(dep) {
                    continue;
                }
                let from = *task_index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: spec.id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let level_by_node = kahn_levels(&graph).map_err(|residual| {
            let tasks = find_cycle(&graph, &residual);
            mlog_error!(
                "Circular dependency among tasks: {}",
                tasks
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Error::CircularDependency { tasks }
        })?;

        let depth = level_by_node.values().max().map(|m| m + 1).unwrap_or(0);
        let mut levels: Vec<Vec<TaskId>> = vec![Vec::new(); depth];
        let mut level_of = HashMap::with_capacity(level_by_node.len());
        // Node indices follow input order, which keeps levels deterministic.
        for index in graph.node_indices() {
            let level = level_by_node[&index];
            let id = graph[index].id.clone();
            levels[level].push(id.clone());
            level_of.insert(id, level);
        }

        mlog_debug!(
            "TaskGraphBuilder::build tasks={} edges={} levels={}",
            graph.node_count(),
            graph.edge_count(),
            levels.len()
        );

        Ok(TaskDAG {
            graph,
            task_index,
            levels,
            level_of,
        })
    }
}

/// Kahn's algorithm. Returns the level of every node, or the nodes that were
/// never released (their in-degree stayed non-zero) when a cycle exists.
fn kahn_levels(
    graph: &DiGraph<Task, ()>,
) -> std::result::Result<HashMap<NodeIndex, usize>, Vec<NodeIndex>> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.edges_directed(n, Direction::Incoming).count()))
        .collect();
    let mut level: HashMap<NodeIndex, usize> = HashMap::with_capacity(graph.node_count());
    let mut queue: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n] == 0)
        .collect();
    for n in &queue {
        level.insert(*n, 0);
    }

    let mut processed = 0;
    while let Some(node) = queue.pop_front() {
        processed += 1;
        let node_level = level[&node];
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            let entry = level.entry(next).or_insert(0);
            *entry = (*entry).max(node_level + 1);
            let degree = in_degree.entry(next).or_insert(0);
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                queue.push_back(next);
            }
        }
    }

    if processed == graph.node_count() {
        Ok(level)
    } else {
        Err(graph
            .node_indices()
            .filter(|n| in_degree[n] > 0)
            .collect())
    }
}

/// Pick an actual cycle out of the residual nodes.
///
/// Residual nodes include tasks that merely depend on a cycle; the strongly
/// connected components isolate the cycle members themselves.
fn find_cycle(graph: &DiGraph<Task, ()>, residual: &[NodeIndex]) -> Vec<TaskId> {
    let residual: HashSet<NodeIndex> = residual.iter().copied().collect();
    let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| {
            scc.iter().all(|n| residual.contains(n))
                && (scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        })
        .collect();
    for scc in &mut cycles {
        scc.sort();
    }
    cycles.sort_by_key(|scc| scc[0]);

    match cycles.into_iter().next() {
        Some(scc) => scc.into_iter().map(|n| graph[n].id.clone()).collect(),
        None => {
            let mut nodes: Vec<NodeIndex> = residual.into_iter().collect();
            nodes.sort();
            nodes.into_iter().map(|n| graph[n].id.clone()).collect()
        }
    }
}

impl TaskDAG {
    /// Get a reference to a task by its ID.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// All tasks in input order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// The leveled execution plan; level `k + 1` may only start once every
    /// task in level `k` is terminal.
    pub fn levels(&self) -> &[Vec<TaskId>] {
        &self.levels
    }

    pub fn level_of(&self, id: &TaskId) -> Option<usize> {
        self.level_of.get(id).copied()
    }

    /// Dependency edges as `(from, to)` pairs, where `to` depends on `from`.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].id.clone(), self.graph[b].id.clone()))
            .collect()
    }

    /// Tasks the given task depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("levels", &self.levels.len())
            .finish()
    }
}

/// Restrict a batch to the selected tasks plus everything they transitively
/// depend on, preserving input order.
pub fn select_with_dependencies(specs: &[TaskSpec], selected: &[TaskId]) -> Result<Vec<TaskSpec>> {
    let by_id: HashMap<&TaskId, &TaskSpec> = specs.iter().map(|s| (&s.id, s)).collect();
    let mut keep: HashSet<TaskId> = HashSet::new();
    let mut stack: Vec<TaskId> = Vec::new();

    for id in selected {
        if !by_id.contains_key(id) {
            return Err(Error::Validation(format!("Selected task {} not in batch", id)));
        }
        stack.push(id.clone());
    }

    while let Some(id) = stack.pop() {
        if !keep.insert(id.clone()) {
            continue;
        }
        if let Some(spec) = by_id.get(&id) {
            stack.extend(spec.dependencies.iter().cloned());
        }
    }

    Ok(specs
        .iter()
        .filter(|s| keep.contains(&s.id))
        .cloned()
        .collect())
}
