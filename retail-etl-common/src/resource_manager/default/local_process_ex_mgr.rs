use std::{process::Stdio, sync::Arc, time::Duration};
use tracing::{error, info, warn};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use uuid::Uuid;

use crate::{
    error::Error,
    resource_manager::{
        ExecutionContext, ExecutionContextKind, ExecutionManager, LogBuffer,
        ProvisionedWorkerDetails, ProvisionedWorkerStatus, SharedLogBuffer, WorkerRequest,
        WorkerTable,
    },
};

const LOG_COLLECTION_TIMEOUT: Duration = Duration::from_secs(2);
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs tasks as child processes of the current process.
#[derive(Debug)]
pub struct LocalProcessExecutionManager {
    id: Uuid,
    workers: WorkerTable,
}

impl Default for LocalProcessExecutionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcessExecutionManager {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            workers: WorkerTable::new(),
        }
    }

    /// Creates a task that captures one output pipe of a child process.
    /// ---
    /// Each line is forwarded to tracing and pushed to the shared buffer.
    fn create_log_capture_task<R>(
        pipe: R,
        stream: &'static str,
        worker_id: Uuid,
        log_buffer: SharedLogBuffer,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut line = Vec::new();
            // Output is not guaranteed to be UTF-8; the pipe must stay open
            // until EOF or the child dies on its next write.
            loop {
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = String::from_utf8_lossy(&line).trim_end().to_string();
                        info!(target: "retail_etl::worker", %worker_id, stream, "{}", trimmed);
                        log_buffer.lock().await.push(trimmed);
                        line.clear();
                    }
                    Err(e) => {
                        warn!(%worker_id, stream, "Failed to read worker output: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ExecutionManager for LocalProcessExecutionManager {
    fn manager_id(&self) -> Uuid {
        self.id
    }

    fn supported_resource_type(&self) -> ExecutionContextKind {
        ExecutionContextKind::LocalProcess
    }

    async fn fetch_logs(
        &self,
        details: &ProvisionedWorkerDetails,
        tail_lines: Option<usize>,
    ) -> Result<Vec<String>, Error> {
        self.workers.logs(details.worker_id, tail_lines).await
    }

    async fn get_execution_status(
        &self,
        details: &ProvisionedWorkerDetails,
    ) -> Result<ProvisionedWorkerStatus, Error> {
        self.workers.status(details.worker_id).await
    }

    async fn wait_for_completion(
        &self,
        details: &ProvisionedWorkerDetails,
    ) -> Result<ProvisionedWorkerStatus, Error> {
        self.workers.wait(details.worker_id).await
    }

    async fn provision_and_start_execution(
        &self,
        request: &WorkerRequest,
    ) -> Result<ProvisionedWorkerDetails, Error> {
        let local_proc_config = match &request.execution_context {
            ExecutionContext::LocalProcess(config) => config,
            _ => return Err(Error::Internal("Unsupported execution context".to_string())),
        };

        if local_proc_config.entry_point.is_empty() {
            return Err(Error::InvalidInput("No entry point specified".to_string()));
        }

        let program = &local_proc_config.entry_point[0];
        let init_args = &local_proc_config.entry_point[1..];
        let mut command = tokio::process::Command::new(program);
        command
            .args(init_args)
            .args(&local_proc_config.args)
            .envs(&local_proc_config.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &local_proc_config.working_dir {
            command.current_dir(dir);
        }

        let mut child_proc = command.spawn().map_err(|err| {
            Error::TaskExecution(format!(
                "Failed to spawn local process '{}': {}",
                local_proc_config.command_line(),
                err
            ))
        })?;

        let pid = child_proc
            .id()
            .ok_or_else(|| Error::Internal("Failed to get local process ID".to_string()))?;

        let worker_id = request.worker_id;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let (status_tx, status_rx) = watch::channel(ProvisionedWorkerStatus::Running);
        let shared_log_buffer: SharedLogBuffer = Arc::new(Mutex::new(LogBuffer::default()));

        let child_stdout = child_proc
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Failed to get local process stdout".to_string()))?;

        let child_stderr = child_proc
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("Failed to get local process stderr".to_string()))?;

        let exec_timeout = local_proc_config.exec_timeout;
        let log_buffer_for_monitor = shared_log_buffer.clone();

        info!(
            "LocalProcessEM [{}]: Worker {} started '{}' as PID {}.",
            self.id,
            worker_id,
            local_proc_config.command_line(),
            pid
        );

        let monitor_handle = tokio::spawn(async move {
            let stdout_task = Self::create_log_capture_task(
                child_stdout,
                "stdout",
                worker_id,
                log_buffer_for_monitor.clone(),
            );

            let stderr_task = Self::create_log_capture_task(
                child_stderr,
                "stderr",
                worker_id,
                log_buffer_for_monitor,
            );

            let final_status = tokio::select! {
                biased;

                _ = cancel_rx => {
                    if let Err(e) = child_proc.kill().await {
                        error!(
                            "[Monitor {} PID {}] Failed to kill process after cancel signal: {}",
                            worker_id,
                            pid,
                            e,
                        );
                    }

                    ProvisionedWorkerStatus::Cancelled
                },

                exit_result = child_proc.wait() => {
                    match exit_result {
                        Ok(status) if status.success() => {
                            info!("[Monitor {} PID {}] Process exited with status: {}", worker_id, pid, status);
                            ProvisionedWorkerStatus::Succeeded
                        }
                        Ok(status) => {
                            let message = format!("Process exited with status: {}", status);
                            warn!("[Monitor {} PID {}] {}", worker_id, pid, message);
                            ProvisionedWorkerStatus::Failed(message)
                        }
                        Err(e) => {
                            let message = format!("Error waiting for process exit: {}", e);
                            error!("[Monitor {} PID {}] {}", worker_id, pid, message);
                            ProvisionedWorkerStatus::ErrorState(message)
                        }
                    }
                },

                _ = async {
                    match exec_timeout {
                        Some(dur) => tokio::time::sleep(dur).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    warn!(
                        "[Monitor {} PID {}] Execution timeout of {:?} reached, killing process.",
                        worker_id,
                        pid,
                        exec_timeout,
                    );

                    if let Err(e) = child_proc.kill().await {
                        error!("[Monitor {} PID {}] Failed to kill process after timeout: {}", worker_id, pid, e);
                    }

                    ProvisionedWorkerStatus::TimedOut
                },
            };

            // Log tasks end when the pipes close after process exit.
            if timeout(LOG_COLLECTION_TIMEOUT, stdout_task).await.is_err() {
                error!(
                    "[Monitor {} PID {}] Timeout waiting for stdout log task to complete.",
                    worker_id, pid
                );
            }

            if timeout(LOG_COLLECTION_TIMEOUT, stderr_task).await.is_err() {
                error!(
                    "[Monitor {} PID {}] Timeout waiting for stderr log task to complete.",
                    worker_id, pid,
                );
            }

            info!(
                "[Monitor {} PID {}] Finished with status {:?}.",
                worker_id, pid, final_status,
            );

            let _ = status_tx.send(final_status);
        });

        self.workers
            .track(
                worker_id,
                status_rx,
                cancel_tx,
                monitor_handle,
                shared_log_buffer,
            )
            .await;

        Ok(ProvisionedWorkerDetails {
            worker_id,
            platform_id: format!("local_process_{}", pid),
            manager_id: self.id,
            resource_type_provisioned: ExecutionContextKind::LocalProcess,
        })
    }

    async fn cancel_execution(&self, details: &ProvisionedWorkerDetails) -> Result<(), Error> {
        self.workers.cancel(details.worker_id).await
    }

    async fn teardown_worker(&self, details: &ProvisionedWorkerDetails) -> Result<(), Error> {
        self.workers
            .teardown(details.worker_id, TEARDOWN_GRACE)
            .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::resource_manager::LocalProcessExecutionContext;

    fn shell_request(script: &str, exec_timeout: Option<Duration>) -> WorkerRequest {
        WorkerRequest {
            pipeline_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            execution_context: ExecutionContext::LocalProcess(LocalProcessExecutionContext {
                entry_point: vec!["sh".to_string()],
                args: vec!["-c".to_string(), script.to_string()],
                env_vars: HashMap::new(),
                working_dir: None,
                exec_timeout,
            }),
        }
    }

    #[tokio::test]
    async fn test_successful_process_captures_output() {
        let em = LocalProcessExecutionManager::new();
        let details = em
            .provision_and_start_execution(&shell_request("echo one && echo two >&2", None))
            .await
            .unwrap();

        let status = em.wait_for_completion(&details).await.unwrap();
        assert_eq!(status, ProvisionedWorkerStatus::Succeeded);

        let mut logs = em.fetch_logs(&details, None).await.unwrap();
        logs.sort();
        assert_eq!(logs, vec!["one", "two"]);

        em.teardown_worker(&details).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_capturing() {
        let em = LocalProcessExecutionManager::new();
        let details = em
            .provision_and_start_execution(&shell_request(
                "printf 'caf\\351\\n'; sleep 0.3; echo after",
                None,
            ))
            .await
            .unwrap();

        let status = em.wait_for_completion(&details).await.unwrap();
        assert_eq!(status, ProvisionedWorkerStatus::Succeeded);

        let logs = em.fetch_logs(&details, None).await.unwrap();
        assert_eq!(logs, vec!["caf\u{FFFD}", "after"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let em = LocalProcessExecutionManager::new();
        let details = em
            .provision_and_start_execution(&shell_request("echo broken && exit 3", None))
            .await
            .unwrap();

        match em.wait_for_completion(&details).await.unwrap() {
            ProvisionedWorkerStatus::Failed(message) => assert!(message.contains('3')),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_env_vars_are_passed() {
        let em = LocalProcessExecutionManager::new();
        let mut request = shell_request("echo \"$RETAIL_ETL_TEST_VAR\"", None);
        if let ExecutionContext::LocalProcess(ctx) = &mut request.execution_context {
            ctx.env_vars
                .insert("RETAIL_ETL_TEST_VAR".to_string(), "from-env".to_string());
        }

        let details = em.provision_and_start_execution(&request).await.unwrap();
        em.wait_for_completion(&details).await.unwrap();

        assert_eq!(
            em.fetch_logs(&details, Some(1)).await.unwrap(),
            vec!["from-env"]
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let em = LocalProcessExecutionManager::new();
        let details = em
            .provision_and_start_execution(&shell_request(
                "sleep 10",
                Some(Duration::from_millis(200)),
            ))
            .await
            .unwrap();

        assert_eq!(
            em.wait_for_completion(&details).await.unwrap(),
            ProvisionedWorkerStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn test_cancel_running_process() {
        let em = LocalProcessExecutionManager::new();
        let details = em
            .provision_and_start_execution(&shell_request("sleep 10", None))
            .await
            .unwrap();

        em.cancel_execution(&details).await.unwrap();
        assert_eq!(
            em.wait_for_completion(&details).await.unwrap(),
            ProvisionedWorkerStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let em = LocalProcessExecutionManager::new();
        let mut request = shell_request("", None);
        if let ExecutionContext::LocalProcess(ctx) = &mut request.execution_context {
            ctx.entry_point = vec!["/nonexistent/retail-etl-binary".to_string()];
        }

        let err = em.provision_and_start_execution(&request).await.unwrap_err();
        assert!(matches!(err, Error::TaskExecution(_)));
    }
}
