use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resource_manager::ExecutionContext;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub name: String,
    pub description: Option<String>,

    /// How and where the task is executed
    pub execution_context: ExecutionContext,

    /// Task ids on which this task depends
    pub depends_on: Vec<Uuid>,
}

impl TaskDefinition {
    /// Derives a stable task id from the owning pipeline and the task name,
    /// so the same definition always yields the same id across runs.
    pub fn stable_id(pipeline_id: Uuid, name: &str) -> Uuid {
        Uuid::new_v5(&pipeline_id, name.as_bytes())
    }
}
