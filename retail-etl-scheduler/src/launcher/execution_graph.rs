use std::collections::HashMap;

use petgraph::{
    Direction::Incoming,
    algo::toposort,
    graph::{DiGraph, NodeIndex},
};
use retail_etl_common::{
    error::Error,
    pipeline::{PipelineDefinition, PipelineRunStatus},
    task::{TaskDefinition, TaskRunStatus},
};
use tracing::warn;
use uuid::Uuid;

pub struct PipelineExecutionGraph {
    /// The directed graph where nodes are task definitions and edges represent dependencies.
    /// An edge from Task A to Task B means Task A must complete before Task B can start.
    graph: DiGraph<TaskDefinition, ()>,

    /// Mapping from a task's Uuid to its NodeIndex in the petgraph.
    task_id_to_node_idx: HashMap<Uuid, NodeIndex>,

    /// Task ids in a topological order, ties broken by declaration order.
    execution_order: Vec<Uuid>,
}

impl PipelineExecutionGraph {
    /// Creates a new `PipelineExecutionGraph` from a `PipelineDefinition`.
    /// This involves adding all tasks as nodes and then adding edges based on the
    /// `depends_on` field of each task.
    /// Duplicate ids, unknown upstream ids and cycles are rejected.
    pub fn new(pipeline_def: &PipelineDefinition) -> Result<Self, Error> {
        let mut graph = DiGraph::new();
        let mut task_id_to_node_idx = HashMap::new();

        if pipeline_def.task_definitions.is_empty() {
            warn!(
                "Creating an execution graph for an empty pipeline definition ({}).",
                pipeline_def.info.name
            );
        }

        for task_def in &pipeline_def.task_definitions {
            if task_id_to_node_idx.contains_key(&task_def.id) {
                return Err(Error::Conflict(format!(
                    "Duplicate task '{}' ({}) found in pipeline definition {}.",
                    task_def.name, task_def.id, pipeline_def.info.name
                )));
            }

            let node_idx = graph.add_node(task_def.clone());
            task_id_to_node_idx.insert(task_def.id, node_idx);
        }

        for task_def in &pipeline_def.task_definitions {
            let node_idx = task_id_to_node_idx[&task_def.id];

            for dep_task_id in &task_def.depends_on {
                let from_node_idx = task_id_to_node_idx.get(dep_task_id).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Task '{}' depends on unknown task ID {} in pipeline definition {}.",
                        task_def.name, dep_task_id, pipeline_def.info.name
                    ))
                })?;

                graph.add_edge(*from_node_idx, node_idx, ());
            }
        }

        // toposort only proves acyclicity, stable_order picks the actual order.
        let sorted = toposort(&graph, None).map_err(|_| {
            Error::Conflict(format!(
                "Cyclic dependency graph detected for pipeline definition {}.",
                pipeline_def.info.name
            ))
        })?;

        let execution_order = Self::stable_order(&graph, sorted);

        Ok(Self {
            graph,
            task_id_to_node_idx,
            execution_order,
        })
    }

    /// Kahn's algorithm picking the lowest node index, i.e. the earliest
    /// declared task, among the available nodes.
    fn stable_order(graph: &DiGraph<TaskDefinition, ()>, sorted: Vec<NodeIndex>) -> Vec<Uuid> {
        let mut in_degree: HashMap<NodeIndex, usize> = sorted
            .iter()
            .map(|idx| (*idx, graph.neighbors_directed(*idx, Incoming).count()))
            .collect();

        let mut available: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(idx, _)| *idx)
            .collect();

        let mut order = Vec::with_capacity(sorted.len());

        loop {
            available.sort_by(|a, b| b.cmp(a));
            let Some(next) = available.pop() else {
                break;
            };
            order.push(graph[next].id);

            for succ in graph.neighbors(next) {
                if let Some(deg) = in_degree.get_mut(&succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        available.push(succ);
                    }
                }
            }
        }

        order
    }

    /// Retrieves a reference to a task definition by its ID.
    pub fn get_task_definition(&self, task_def_id: Uuid) -> Option<&TaskDefinition> {
        self.task_id_to_node_idx
            .get(&task_def_id)
            .and_then(|node_idx| self.graph.node_weight(*node_idx))
    }

    /// All task ids, upstream tasks before their dependents.
    pub fn execution_order(&self) -> &[Uuid] {
        &self.execution_order
    }

    fn predecessors(&self, task_def_id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        let node_idx = self.task_id_to_node_idx.get(&task_def_id).copied();

        node_idx
            .into_iter()
            .flat_map(move |idx| self.graph.neighbors_directed(idx, Incoming))
            .map(move |pred| self.graph[pred].id)
    }

    /// Identifies pending tasks whose direct dependencies have all succeeded,
    /// in execution order.
    pub fn get_ready_tasks(&self, current_task_states: &HashMap<Uuid, TaskRunStatus>) -> Vec<Uuid> {
        self.execution_order
            .iter()
            .copied()
            .filter(|task_id| current_task_states.get(task_id) == Some(&TaskRunStatus::Pending))
            .filter(|task_id| {
                self.predecessors(*task_id).all(|dep| {
                    current_task_states.get(&dep) == Some(&TaskRunStatus::Succeeded)
                })
            })
            .collect()
    }

    /// Pending tasks that can never start because a direct dependency ended
    /// without succeeding.
    pub fn get_blocked_tasks(&self, current_task_states: &HashMap<Uuid, TaskRunStatus>) -> Vec<Uuid> {
        self.execution_order
            .iter()
            .copied()
            .filter(|task_id| current_task_states.get(task_id) == Some(&TaskRunStatus::Pending))
            .filter(|task_id| {
                self.predecessors(*task_id).any(|dep| {
                    matches!(
                        current_task_states.get(&dep),
                        Some(TaskRunStatus::Failed)
                            | Some(TaskRunStatus::UpstreamFailed)
                            | Some(TaskRunStatus::Cancelled)
                    )
                })
            })
            .collect()
    }

    /// Checks if the entire pipeline has completed based on the states of its tasks.
    ///
    /// # Returns
    /// * `Some(PipelineRunStatus::Succeeded)` if all tasks finished successfully.
    /// * `Some(PipelineRunStatus::Cancelled)` if all tasks are terminal and any was cancelled.
    /// * `Some(PipelineRunStatus::Failed)` if all tasks are terminal and any failed.
    /// * `None` if some task is not yet in a terminal state.
    pub fn is_pipeline_complete(
        &self,
        current_task_states: &HashMap<Uuid, TaskRunStatus>,
    ) -> Option<PipelineRunStatus> {
        let mut any_failed = false;
        let mut any_cancelled = false;

        for task_def_id in &self.execution_order {
            match current_task_states.get(task_def_id) {
                Some(TaskRunStatus::Succeeded) => {}
                Some(TaskRunStatus::Failed) | Some(TaskRunStatus::UpstreamFailed) => {
                    any_failed = true;
                }
                Some(TaskRunStatus::Cancelled) => any_cancelled = true,
                Some(TaskRunStatus::Pending)
                | Some(TaskRunStatus::Queued)
                | Some(TaskRunStatus::Running)
                | None => return None,
            }
        }

        if any_cancelled {
            Some(PipelineRunStatus::Cancelled)
        } else if any_failed {
            Some(PipelineRunStatus::Failed)
        } else {
            Some(PipelineRunStatus::Succeeded)
        }
    }
}
