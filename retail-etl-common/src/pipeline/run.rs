use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::task::TaskRun;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_def_id: Uuid,
    pub pipeline_name: String,
    pub logical_date: NaiveDate,
    pub status: PipelineRunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub task_runs: Vec<TaskRun>,
}

impl PipelineRun {
    pub fn new(pipeline_def_id: Uuid, pipeline_name: &str, logical_date: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_def_id,
            pipeline_name: pipeline_name.to_string(),
            logical_date,
            status: PipelineRunStatus::Pending,
            start_time: None,
            end_time: None,
            task_runs: Vec::new(),
        }
    }

    pub fn task_run(&self, task_def_id: Uuid) -> Option<&TaskRun> {
        self.task_runs.iter().find(|t| t.task_def_id == task_def_id)
    }

    pub fn task_run_mut(&mut self, task_def_id: Uuid) -> Option<&mut TaskRun> {
        self.task_runs
            .iter_mut()
            .find(|t| t.task_def_id == task_def_id)
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}
