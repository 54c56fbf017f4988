use std::{collections::HashMap, path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ExecutionContextKind {
    LocalProcess,
    StoredProcedure,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ExecutionContext {
    LocalProcess(LocalProcessExecutionContext),
    StoredProcedure(StoredProcedureExecutionContext),
}

impl ExecutionContext {
    pub fn kind(&self) -> ExecutionContextKind {
        match self {
            ExecutionContext::LocalProcess(_) => ExecutionContextKind::LocalProcess,
            ExecutionContext::StoredProcedure(_) => ExecutionContextKind::StoredProcedure,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalProcessExecutionContext {
    /// Program followed by its fixed leading arguments
    pub entry_point: Vec<String>,
    pub args: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub exec_timeout: Option<Duration>,
}

impl LocalProcessExecutionContext {
    /// Renders the full command line, for display only.
    pub fn command_line(&self) -> String {
        self.entry_point
            .iter()
            .chain(self.args.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredProcedureExecutionContext {
    /// Fully-qualified procedure name, invoked without arguments
    pub procedure: String,
}

#[derive(Clone, Debug)]
pub struct WorkerRequest {
    pub pipeline_id: Uuid,
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub worker_id: Uuid,
    pub execution_context: ExecutionContext,
}

#[derive(Clone, Debug)]
pub struct ProvisionedWorkerDetails {
    pub worker_id: Uuid,
    pub platform_id: String,
    pub manager_id: Uuid,
    pub resource_type_provisioned: ExecutionContextKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisionedWorkerStatus {
    Initializing,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
    TimedOut,
    ErrorState(String),
}

impl ProvisionedWorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisionedWorkerStatus::Succeeded
                | ProvisionedWorkerStatus::Failed(_)
                | ProvisionedWorkerStatus::Cancelled
                | ProvisionedWorkerStatus::TimedOut
                | ProvisionedWorkerStatus::ErrorState(_)
        )
    }
}

/// A backend able to run one kind of task.
/// ---
/// Execution is started by `provision_and_start_execution` and
/// observed through the returned `ProvisionedWorkerDetails`.
/// Every started worker must eventually be passed to `teardown_worker`.
#[async_trait]
pub trait ExecutionManager: Send + Sync {
    fn manager_id(&self) -> Uuid;

    fn supported_resource_type(&self) -> ExecutionContextKind;

    async fn provision_and_start_execution(
        &self,
        request: &WorkerRequest,
    ) -> Result<ProvisionedWorkerDetails, Error>;

    async fn get_execution_status(
        &self,
        details: &ProvisionedWorkerDetails,
    ) -> Result<ProvisionedWorkerStatus, Error>;

    /// Resolves once the worker reached a terminal status.
    async fn wait_for_completion(
        &self,
        details: &ProvisionedWorkerDetails,
    ) -> Result<ProvisionedWorkerStatus, Error>;

    async fn fetch_logs(
        &self,
        details: &ProvisionedWorkerDetails,
        tail_lines: Option<usize>,
    ) -> Result<Vec<String>, Error>;

    async fn cancel_execution(&self, details: &ProvisionedWorkerDetails) -> Result<(), Error>;

    async fn teardown_worker(&self, details: &ProvisionedWorkerDetails) -> Result<(), Error>;
}
