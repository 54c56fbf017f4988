use std::{collections::HashMap, sync::Arc};

use chrono::{NaiveDate, Utc};
use retail_etl_common::{
    error::{Error, WorkerError},
    event::{EventLogRecord, EventType},
    pipeline::{PipelineDefinition, PipelineRun, PipelineRunStatus},
    resource_manager::{ExecutionManager, ProvisionedWorkerDetails, ProvisionedWorkerStatus, WorkerRequest},
    task::{TaskDefinition, TaskRun, TaskRunStatus},
};
use tokio::sync::watch;
use tracing::{error, warn};
use uuid::Uuid;

use super::{ExecutionManagerRegistry, PipelineExecutionGraph};

const OUTPUT_TAIL_LINES: usize = 20;

/// Executes pipeline runs, one task at a time.
pub struct Launcher {
    pub id: Uuid,
    exec_managers: Arc<ExecutionManagerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

struct TaskOutcome {
    status: TaskRunStatus,
    message: Option<String>,
    error: Option<WorkerError>,
}

impl TaskOutcome {
    fn failed(error_type: &str, message: String, output_tail: Vec<String>) -> Self {
        Self {
            status: TaskRunStatus::Failed,
            message: Some(message.clone()),
            error: Some(WorkerError {
                error_type: error_type.to_string(),
                message,
                output_tail,
            }),
        }
    }
}

impl Launcher {
    /// `shutdown_rx` flipping to `true` cancels the running task and stops
    /// further tasks from starting.
    pub fn new(exec_managers: Arc<ExecutionManagerRegistry>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            id: Uuid::new_v4(),
            exec_managers,
            shutdown_rx,
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Runs every task of `pipeline_def` in dependency order.
    /// ---
    /// A task starts only after all of its upstream tasks succeeded. When a
    /// task fails, its downstream tasks are marked `UPSTREAM_FAILED` and the
    /// run ends `FAILED`. Task failures are reported through the returned
    /// run; `Err` is reserved for invalid definitions.
    pub async fn execute_pipeline(
        &self,
        pipeline_def: &PipelineDefinition,
        logical_date: NaiveDate,
    ) -> Result<PipelineRun, Error> {
        let graph = PipelineExecutionGraph::new(pipeline_def)?;

        let mut run = PipelineRun::new(pipeline_def.info.id, &pipeline_def.info.name, logical_date);
        let mut task_states: HashMap<Uuid, TaskRunStatus> = HashMap::new();

        for task_id in graph.execution_order() {
            let task_def = graph.get_task_definition(*task_id).ok_or_else(|| {
                Error::Internal(format!("Failed to find TaskDefinition for task ID {}", task_id))
            })?;
            run.task_runs.push(TaskRun::new(run.id, task_def.id, &task_def.name));
            task_states.insert(task_def.id, TaskRunStatus::Pending);
        }

        run.status = PipelineRunStatus::Running;
        run.start_time = Some(Utc::now());
        EventLogRecord::new(
            EventType::RunStart,
            Some(run.id),
            None,
            Some(format!(
                "Launcher [{}]: starting {} for {}",
                self.id, pipeline_def.info.name, logical_date
            )),
        )
        .emit();

        let final_status = loop {
            // Repeat until stable so the failure reaches every transitive dependent.
            loop {
                let blocked = graph.get_blocked_tasks(&task_states);
                if blocked.is_empty() {
                    break;
                }
                for blocked_id in blocked {
                    self.record_outcome(
                        &mut run,
                        &mut task_states,
                        blocked_id,
                        TaskOutcome {
                            status: TaskRunStatus::UpstreamFailed,
                            message: Some("An upstream task did not succeed".to_string()),
                            error: None,
                        },
                    );
                }
            }

            if let Some(status) = graph.is_pipeline_complete(&task_states) {
                break status;
            }

            let Some(next_task_id) = graph.get_ready_tasks(&task_states).first().copied() else {
                return Err(Error::Internal(format!(
                    "Pipeline run {} has no runnable task but is not complete",
                    run.id
                )));
            };

            if self.shutdown_requested() {
                warn!(
                    "Launcher [{}]: shutdown requested, not starting remaining tasks.",
                    self.id
                );
                let pending: Vec<Uuid> = task_states
                    .iter()
                    .filter(|(_, status)| **status == TaskRunStatus::Pending)
                    .map(|(id, _)| *id)
                    .collect();
                for task_id in pending {
                    self.record_outcome(
                        &mut run,
                        &mut task_states,
                        task_id,
                        TaskOutcome {
                            status: TaskRunStatus::Cancelled,
                            message: Some("Shutdown requested before start".to_string()),
                            error: None,
                        },
                    );
                }
                continue;
            }

            let task_def = graph.get_task_definition(next_task_id).ok_or_else(|| {
                Error::Internal(format!("Failed to find TaskDefinition for task ID {}", next_task_id))
            })?;

            task_states.insert(next_task_id, TaskRunStatus::Running);
            if let Some(task_run) = run.task_run_mut(next_task_id) {
                task_run.status = TaskRunStatus::Running;
                task_run.start_time = Some(Utc::now());
            }

            let max_attempts = pipeline_def.info.retries.saturating_add(1);
            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                if let Some(task_run) = run.task_run_mut(next_task_id) {
                    task_run.attempt = attempt;
                }
                EventLogRecord::new(
                    EventType::TaskStart,
                    Some(run.id),
                    Some(next_task_id),
                    Some(format!(
                        "Starting task '{}' (attempt {}/{})",
                        task_def.name, attempt, max_attempts
                    )),
                )
                .emit();

                let outcome = self.run_task(pipeline_def, run.id, task_def).await;
                if outcome.status != TaskRunStatus::Failed
                    || attempt >= max_attempts
                    || self.shutdown_requested()
                {
                    break outcome;
                }
                warn!(
                    "Launcher [{}]: task '{}' failed on attempt {}, retrying.",
                    self.id, task_def.name, attempt
                );
            };
            self.record_outcome(&mut run, &mut task_states, next_task_id, outcome);
        };

        run.status = final_status;
        run.end_time = Some(Utc::now());

        let event_type = match final_status {
            PipelineRunStatus::Succeeded => EventType::RunSuccess,
            _ => EventType::RunFailure,
        };
        EventLogRecord::new(
            event_type,
            Some(run.id),
            None,
            Some(format!("{} finished with status {}", pipeline_def.info.name, final_status)),
        )
        .emit();

        Ok(run)
    }

    fn record_outcome(
        &self,
        run: &mut PipelineRun,
        task_states: &mut HashMap<Uuid, TaskRunStatus>,
        task_id: Uuid,
        outcome: TaskOutcome,
    ) {
        task_states.insert(task_id, outcome.status);

        let run_id = run.id;
        let Some(task_run) = run.task_run_mut(task_id) else {
            error!("Launcher [{}]: no task run recorded for task {}", self.id, task_id);
            return;
        };

        task_run.status = outcome.status;
        task_run.end_time = Some(Utc::now());
        task_run.message = outcome.message.clone();
        task_run.error = outcome.error;

        let event_type = match outcome.status {
            TaskRunStatus::Succeeded => EventType::TaskSuccess,
            TaskRunStatus::UpstreamFailed => EventType::TaskUpstreamFailed,
            TaskRunStatus::Cancelled => EventType::TaskCancelled,
            _ => EventType::TaskFailure,
        };
        EventLogRecord::new(
            event_type,
            Some(run_id),
            Some(task_id),
            Some(format!(
                "Task '{}' {}{}",
                task_run.name,
                outcome.status,
                outcome.message.map(|m| format!(": {m}")).unwrap_or_default()
            )),
        )
        .emit();
    }

    async fn run_task(
        &self,
        pipeline_def: &PipelineDefinition,
        run_id: Uuid,
        task_def: &TaskDefinition,
    ) -> TaskOutcome {
        let kind = task_def.execution_context.kind();
        let Some(manager) = self.exec_managers.get_manager(kind) else {
            return TaskOutcome::failed(
                "Config",
                format!("No execution manager registered for {kind}"),
                Vec::new(),
            );
        };

        let request = WorkerRequest {
            pipeline_id: pipeline_def.info.id,
            run_id,
            task_id: task_def.id,
            worker_id: Uuid::new_v4(),
            execution_context: task_def.execution_context.clone(),
        };

        let details = match manager.provision_and_start_execution(&request).await {
            Ok(details) => details,
            Err(e) => {
                error!(
                    "Launcher [{}]: Failed to launch worker for task '{}': {}",
                    self.id, task_def.name, e
                );
                return TaskOutcome::failed("LaunchError", e.to_string(), Vec::new());
            }
        };

        let em_status = self.await_worker(manager.as_ref(), &details).await;

        let output_tail = manager
            .fetch_logs(&details, Some(OUTPUT_TAIL_LINES))
            .await
            .unwrap_or_default();

        if let Err(e) = manager.teardown_worker(&details).await {
            warn!(
                "Launcher [{}]: Failed to teardown worker {}: {}",
                self.id, details.worker_id, e
            );
        }

        Self::map_em_status_to_outcome(em_status, output_tail)
    }

    async fn await_worker(
        &self,
        manager: &dyn ExecutionManager,
        details: &ProvisionedWorkerDetails,
    ) -> ProvisionedWorkerStatus {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown = async move {
            // A dropped sender means shutdown can no longer be requested.
            if shutdown_rx.wait_for(|requested| *requested).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let waited = tokio::select! {
            status = manager.wait_for_completion(details) => status,
            _ = shutdown => {
                warn!("Launcher [{}]: shutdown requested, cancelling worker {}.", self.id, details.worker_id);
                if let Err(e) = manager.cancel_execution(details).await {
                    error!("Launcher [{}]: Failed to cancel worker {}: {}", self.id, details.worker_id, e);
                }
                manager.wait_for_completion(details).await
            }
        };

        waited.unwrap_or_else(|e| ProvisionedWorkerStatus::ErrorState(e.to_string()))
    }

    /// Maps an execution manager's terminal status onto the task status
    /// recorded in the run.
    fn map_em_status_to_outcome(
        em_status: ProvisionedWorkerStatus,
        output_tail: Vec<String>,
    ) -> TaskOutcome {
        match em_status {
            ProvisionedWorkerStatus::Succeeded => TaskOutcome {
                status: TaskRunStatus::Succeeded,
                message: None,
                error: None,
            },
            ProvisionedWorkerStatus::Failed(message) => {
                TaskOutcome::failed("Failed", message, output_tail)
            }
            ProvisionedWorkerStatus::TimedOut => {
                TaskOutcome::failed("TimedOut", "Execution timed out".to_string(), output_tail)
            }
            ProvisionedWorkerStatus::ErrorState(message) => {
                TaskOutcome::failed("ErrorState", message, output_tail)
            }
            ProvisionedWorkerStatus::Cancelled => TaskOutcome {
                status: TaskRunStatus::Cancelled,
                message: Some("Cancelled".to_string()),
                error: None,
            },
            other @ (ProvisionedWorkerStatus::Initializing | ProvisionedWorkerStatus::Running) => {
                TaskOutcome::failed(
                    "ErrorState",
                    format!("Worker returned non-terminal status {other:?}"),
                    output_tail,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use retail_etl_common::{
        pipeline::{PipelineInfo, Schedule},
        resource_manager::{
            ExecutionContext, ExecutionContextKind, LocalProcessExecutionContext,
            StoredProcedureExecutionContext,
        },
    };

    use super::*;

    /// Records the order tasks were started in and finishes each one with
    /// the status configured for its name.
    struct ScriptedManager {
        id: Uuid,
        kind: ExecutionContextKind,
        outcomes: HashMap<String, ProvisionedWorkerStatus>,
        started: Arc<Mutex<Vec<String>>>,
        workers: Mutex<HashMap<Uuid, ProvisionedWorkerStatus>>,
    }

    impl ScriptedManager {
        fn new(
            kind: ExecutionContextKind,
            outcomes: &[(&str, ProvisionedWorkerStatus)],
            started: Arc<Mutex<Vec<String>>>,
        ) -> Self {
            Self {
                id: Uuid::new_v4(),
                kind,
                outcomes: outcomes
                    .iter()
                    .map(|(name, status)| (name.to_string(), status.clone()))
                    .collect(),
                started,
                workers: Mutex::new(HashMap::new()),
            }
        }

        fn key(context: &ExecutionContext) -> String {
            match context {
                ExecutionContext::LocalProcess(ctx) => ctx.command_line(),
                ExecutionContext::StoredProcedure(ctx) => ctx.procedure.clone(),
            }
        }
    }

    #[async_trait]
    impl ExecutionManager for ScriptedManager {
        fn manager_id(&self) -> Uuid {
            self.id
        }

        fn supported_resource_type(&self) -> ExecutionContextKind {
            self.kind
        }

        async fn provision_and_start_execution(
            &self,
            request: &WorkerRequest,
        ) -> Result<ProvisionedWorkerDetails, Error> {
            let key = Self::key(&request.execution_context);
            self.started.lock().unwrap().push(key.clone());
            let status = self
                .outcomes
                .get(&key)
                .cloned()
                .unwrap_or(ProvisionedWorkerStatus::Succeeded);
            self.workers.lock().unwrap().insert(request.worker_id, status);

            Ok(ProvisionedWorkerDetails {
                worker_id: request.worker_id,
                platform_id: key,
                manager_id: self.id,
                resource_type_provisioned: self.kind,
            })
        }

        async fn get_execution_status(
            &self,
            details: &ProvisionedWorkerDetails,
        ) -> Result<ProvisionedWorkerStatus, Error> {
            self.wait_for_completion(details).await
        }

        async fn wait_for_completion(
            &self,
            details: &ProvisionedWorkerDetails,
        ) -> Result<ProvisionedWorkerStatus, Error> {
            self.workers
                .lock()
                .unwrap()
                .get(&details.worker_id)
                .cloned()
                .ok_or_else(|| Error::Internal("unknown worker".to_string()))
        }

        async fn fetch_logs(
            &self,
            details: &ProvisionedWorkerDetails,
            _tail_lines: Option<usize>,
        ) -> Result<Vec<String>, Error> {
            Ok(vec![format!("output of {}", details.platform_id)])
        }

        async fn cancel_execution(&self, _details: &ProvisionedWorkerDetails) -> Result<(), Error> {
            Ok(())
        }

        async fn teardown_worker(&self, details: &ProvisionedWorkerDetails) -> Result<(), Error> {
            self.workers.lock().unwrap().remove(&details.worker_id);
            Ok(())
        }
    }

    fn command_task(info: &PipelineInfo, name: &str, deps: &[&str]) -> TaskDefinition {
        TaskDefinition {
            id: TaskDefinition::stable_id(info.id, name),
            pipeline_id: info.id,
            name: name.to_string(),
            description: None,
            execution_context: ExecutionContext::LocalProcess(LocalProcessExecutionContext {
                entry_point: vec![name.to_string()],
                ..Default::default()
            }),
            depends_on: deps.iter().map(|d| TaskDefinition::stable_id(info.id, d)).collect(),
        }
    }

    fn retail_like_pipeline() -> PipelineDefinition {
        let info = PipelineInfo::new(
            "launcher_test",
            None,
            Schedule::daily(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
        );
        let load = TaskDefinition {
            id: TaskDefinition::stable_id(info.id, "load"),
            pipeline_id: info.id,
            name: "load".to_string(),
            description: None,
            execution_context: ExecutionContext::StoredProcedure(StoredProcedureExecutionContext {
                procedure: "pkg.load".to_string(),
            }),
            depends_on: vec![TaskDefinition::stable_id(info.id, "generate")],
        };

        PipelineDefinition {
            task_definitions: vec![
                command_task(&info, "reset", &[]),
                command_task(&info, "generate", &["reset"]),
                load,
            ],
            info,
        }
    }

    fn launcher(
        command_outcomes: &[(&str, ProvisionedWorkerStatus)],
        procedure_outcomes: &[(&str, ProvisionedWorkerStatus)],
    ) -> (Launcher, Arc<Mutex<Vec<String>>>, watch::Sender<bool>) {
        let started = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ExecutionManagerRegistry::new();
        registry.register_manager(Arc::new(ScriptedManager::new(
            ExecutionContextKind::LocalProcess,
            command_outcomes,
            started.clone(),
        )));
        registry.register_manager(Arc::new(ScriptedManager::new(
            ExecutionContextKind::StoredProcedure,
            procedure_outcomes,
            started.clone(),
        )));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (Launcher::new(Arc::new(registry), shutdown_rx), started, shutdown_tx)
    }

    fn statuses(run: &PipelineRun) -> Vec<(String, TaskRunStatus)> {
        run.task_runs
            .iter()
            .map(|t| (t.name.clone(), t.status))
            .collect()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[tokio::test]
    async fn test_all_steps_run_in_order() {
        let (launcher, started, _tx) = launcher(&[], &[]);
        let run = launcher
            .execute_pipeline(&retail_like_pipeline(), date())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineRunStatus::Succeeded);
        assert_eq!(*started.lock().unwrap(), vec!["reset", "generate", "pkg.load"]);
        assert!(run.task_runs.iter().all(|t| t.attempt == 1 && t.end_time.is_some()));
        assert_eq!(run.logical_date, date());
    }

    #[tokio::test]
    async fn test_failed_step_stops_downstream() {
        let (launcher, started, _tx) = launcher(
            &[("generate", ProvisionedWorkerStatus::Failed("exit 2".to_string()))],
            &[],
        );
        let run = launcher
            .execute_pipeline(&retail_like_pipeline(), date())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(*started.lock().unwrap(), vec!["reset", "generate"]);
        assert_eq!(
            statuses(&run),
            vec![
                ("reset".to_string(), TaskRunStatus::Succeeded),
                ("generate".to_string(), TaskRunStatus::Failed),
                ("load".to_string(), TaskRunStatus::UpstreamFailed),
            ]
        );

        let error = run.task_runs[1].error.as_ref().unwrap();
        assert_eq!(error.message, "exit 2");
        assert_eq!(error.output_tail, vec!["output of generate"]);
    }

    #[tokio::test]
    async fn test_failed_first_step_skips_everything_after() {
        let (launcher, started, _tx) = launcher(
            &[("reset", ProvisionedWorkerStatus::TimedOut)],
            &[],
        );
        let run = launcher
            .execute_pipeline(&retail_like_pipeline(), date())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(*started.lock().unwrap(), vec!["reset"]);
        assert_eq!(
            statuses(&run),
            vec![
                ("reset".to_string(), TaskRunStatus::Failed),
                ("generate".to_string(), TaskRunStatus::UpstreamFailed),
                ("load".to_string(), TaskRunStatus::UpstreamFailed),
            ]
        );
        assert_eq!(
            run.task_runs[0].error.as_ref().unwrap().error_type,
            "TimedOut"
        );
    }

    #[tokio::test]
    async fn test_retries_rerun_failed_task() {
        let (launcher, started, _tx) = launcher(
            &[("generate", ProvisionedWorkerStatus::Failed("exit 1".to_string()))],
            &[],
        );
        let mut def = retail_like_pipeline();
        def.info.retries = 1;

        let run = launcher.execute_pipeline(&def, date()).await.unwrap();

        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(
            *started.lock().unwrap(),
            vec!["reset", "generate", "generate"]
        );
        assert_eq!(run.task_runs[0].attempt, 1);
        assert_eq!(run.task_runs[1].attempt, 2);
        assert_eq!(run.task_runs[2].status, TaskRunStatus::UpstreamFailed);
    }

    #[tokio::test]
    async fn test_failed_load_fails_run() {
        let (launcher, _started, _tx) = launcher(
            &[],
            &[("pkg.load", ProvisionedWorkerStatus::Failed("ORA-12541".to_string()))],
        );
        let run = launcher
            .execute_pipeline(&retail_like_pipeline(), date())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(run.task_runs[2].status, TaskRunStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_manager_fails_task() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ExecutionManagerRegistry::new();
        registry.register_manager(Arc::new(ScriptedManager::new(
            ExecutionContextKind::LocalProcess,
            &[],
            started.clone(),
        )));
        let (_tx, rx) = watch::channel(false);
        let launcher = Launcher::new(Arc::new(registry), rx);

        let run = launcher
            .execute_pipeline(&retail_like_pipeline(), date())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(
            run.task_runs[2].error.as_ref().unwrap().error_type,
            "Config"
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_start_cancels_run() {
        let (launcher, started, tx) = launcher(&[], &[]);
        tx.send(true).unwrap();

        let run = launcher
            .execute_pipeline(&retail_like_pipeline(), date())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineRunStatus::Cancelled);
        assert!(started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_definition_is_an_error() {
        let (launcher, _started, _tx) = launcher(&[], &[]);
        let mut def = retail_like_pipeline();
        let load_id = def.task_definitions[2].id;
        def.task_definitions[0].depends_on.push(load_id);

        assert!(launcher.execute_pipeline(&def, date()).await.is_err());
    }
}
