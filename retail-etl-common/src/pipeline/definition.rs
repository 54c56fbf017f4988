use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskDefinition;

use super::Schedule;

const PIPELINE_NAMESPACE: Uuid = uuid::uuid!("8f0c1c9e-2b7a-4a44-9d6e-3a51f2c7e0b4");

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner: String,
    pub tags: Vec<String>,
    pub schedule: Schedule,
    /// Extra attempts after a failed task. Zero for the retail pipeline.
    #[serde(default)]
    pub retries: u32,
}

impl PipelineInfo {
    pub fn new(name: &str, description: Option<String>, schedule: Schedule) -> Self {
        Self {
            id: Uuid::new_v5(&PIPELINE_NAMESPACE, name.as_bytes()),
            name: name.to_string(),
            description,
            owner: "retail-etl".to_string(),
            tags: Vec::new(),
            schedule,
            retries: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub info: PipelineInfo,
    pub task_definitions: Vec<TaskDefinition>,
}
