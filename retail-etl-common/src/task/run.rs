use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::error::WorkerError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub task_def_id: Uuid,
    pub name: String,
    pub status: TaskRunStatus,
    pub attempt: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub error: Option<WorkerError>,
}

impl TaskRun {
    pub fn new(pipeline_run_id: Uuid, task_def_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_run_id,
            task_def_id,
            name: name.to_string(),
            status: TaskRunStatus::Pending,
            attempt: 0,
            start_time: None,
            end_time: None,
            message: None,
            error: None,
        }
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    UpstreamFailed,
    Cancelled,
}

impl TaskRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskRunStatus::Succeeded
                | TaskRunStatus::Failed
                | TaskRunStatus::UpstreamFailed
                | TaskRunStatus::Cancelled
        )
    }
}
