use serde::{Deserialize, Serialize};

/// Failure details attached to a task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerError {
    pub error_type: String,
    pub message: String,
    /// Last lines of output captured from the worker, oldest first.
    pub output_tail: Vec<String>,
}
