use chrono::NaiveDate;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineFile {
    pub version: String,
    pub pipeline: Pipeline,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pipeline {
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub retries: u32,
    pub steps: Vec<Step>,
}

/// One pipeline step. Exactly one of `command` and `procedure` is set.
///
/// Without `depends_on` a step depends on the step declared before it;
/// an empty list makes it a root step.
#[derive(Debug, Deserialize, Clone)]
pub struct Step {
    pub name: String,
    pub description: Option<String>,
    pub command: Option<Vec<String>>,
    pub procedure: Option<String>,
    #[serde(default)]
    pub environment: Vec<KvPair>,
    pub working_directory: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub depends_on: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

fn default_schedule() -> String {
    "@daily".to_string()
}
