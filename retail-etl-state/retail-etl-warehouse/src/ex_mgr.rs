use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use retail_etl_common::{
    error::Error,
    resource_manager::{
        ExecutionContext, ExecutionContextKind, ExecutionManager, ProvisionedWorkerDetails,
        ProvisionedWorkerStatus, SharedLogBuffer, WorkerRequest, WorkerTable,
    },
};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{db::WarehouseDb, procedure::ProcedureName};

const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs stored procedure tasks against the configured warehouse.
#[derive(Debug)]
pub struct StoredProcedureExecutionManager {
    id: Uuid,
    db: Arc<WarehouseDb>,
    workers: WorkerTable,
}

impl StoredProcedureExecutionManager {
    pub fn new(db: Arc<WarehouseDb>) -> Self {
        Self {
            id: Uuid::new_v4(),
            db,
            workers: WorkerTable::new(),
        }
    }
}

#[async_trait]
impl ExecutionManager for StoredProcedureExecutionManager {
    fn manager_id(&self) -> Uuid {
        self.id
    }

    fn supported_resource_type(&self) -> ExecutionContextKind {
        ExecutionContextKind::StoredProcedure
    }

    async fn provision_and_start_execution(
        &self,
        request: &WorkerRequest,
    ) -> Result<ProvisionedWorkerDetails, Error> {
        let proc_config = match &request.execution_context {
            ExecutionContext::StoredProcedure(config) => config,
            _ => return Err(Error::Internal("Unsupported execution context".to_string())),
        };

        let procedure: ProcedureName = proc_config.procedure.parse()?;
        let worker_id = request.worker_id;
        let db = self.db.clone();

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let (status_tx, status_rx) = watch::channel(ProvisionedWorkerStatus::Running);
        let log_buffer = SharedLogBuffer::default();
        let log_buffer_for_monitor = log_buffer.clone();
        let procedure_for_monitor = procedure.clone();

        let monitor_handle = tokio::spawn(async move {
            let final_status = tokio::select! {
                biased;

                _ = cancel_rx => {
                    // Dropping the call future drops its connection.
                    warn!("[Procedure {} {}] Cancelled before completion.", worker_id, procedure_for_monitor);
                    ProvisionedWorkerStatus::Cancelled
                },

                result = db.call_procedure(&procedure_for_monitor) => {
                    match result {
                        Ok(()) => ProvisionedWorkerStatus::Succeeded,
                        Err(e) => {
                            log_buffer_for_monitor.lock().await.push(e.to_string());
                            ProvisionedWorkerStatus::Failed(e.to_string())
                        }
                    }
                },
            };

            let _ = status_tx.send(final_status);
        });

        self.workers
            .track(worker_id, status_rx, cancel_tx, monitor_handle, log_buffer)
            .await;

        info!(
            "StoredProcedureEM [{}]: Worker {} calling {}.",
            self.id, worker_id, procedure
        );

        Ok(ProvisionedWorkerDetails {
            worker_id,
            platform_id: format!("stored_procedure_{}", procedure),
            manager_id: self.id,
            resource_type_provisioned: ExecutionContextKind::StoredProcedure,
        })
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

    async fn fetch_logs(
        &self,
        details: &ProvisionedWorkerDetails,
        tail_lines: Option<usize>,
    ) -> Result<Vec<String>, Error> {
        self.workers.logs(details.worker_id, tail_lines).await
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

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use retail_etl_common::resource_manager::StoredProcedureExecutionContext;
    use sea_orm::{DatabaseConnection, DbBackend, MockDatabase, MockExecResult};

    use super::*;
    use crate::{
        config::{Backend, WarehouseConfig},
        db::WarehouseConnector,
        error::WarehouseError,
    };

    #[derive(Debug)]
    struct SucceedingConnector;

    #[async_trait]
    impl WarehouseConnector for SucceedingConnector {
        async fn connect(
            &self,
            _config: &WarehouseConfig,
        ) -> Result<DatabaseConnection, WarehouseError> {
            Ok(MockDatabase::new(DbBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                }])
                .into_connection())
        }
    }

    fn sqlite_config() -> WarehouseConfig {
        WarehouseConfig {
            user: String::new(),
            password: String::new(),
            connect_string: ":memory:".to_string(),
            backend: Backend::Sqlite,
            connect_timeout: Duration::from_secs(2),
            procedure: "pkg_etl_retail.load_daily_sales".parse().unwrap(),
        }
    }

    fn manager() -> StoredProcedureExecutionManager {
        StoredProcedureExecutionManager::new(Arc::new(WarehouseDb::new(sqlite_config())))
    }

    fn request(procedure: &str) -> WorkerRequest {
        WorkerRequest {
            pipeline_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            execution_context: ExecutionContext::StoredProcedure(StoredProcedureExecutionContext {
                procedure: procedure.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_procedure_failure_is_reported_with_logs() {
        let em = manager();
        let details = em
            .provision_and_start_execution(&request("pkg_etl_retail.load_daily_sales"))
            .await
            .unwrap();

        let status = em.wait_for_completion(&details).await.unwrap();
        assert!(matches!(status, ProvisionedWorkerStatus::Failed(_)));

        let logs = em.fetch_logs(&details, None).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("pkg_etl_retail.load_daily_sales"));

        em.teardown_worker(&details).await.unwrap();
    }

    #[tokio::test]
    async fn test_procedure_success_is_reported() {
        let db = WarehouseDb::with_connector(sqlite_config(), Arc::new(SucceedingConnector));
        let em = StoredProcedureExecutionManager::new(Arc::new(db));
        let details = em
            .provision_and_start_execution(&request("pkg_etl_retail.load_daily_sales"))
            .await
            .unwrap();

        assert_eq!(
            em.wait_for_completion(&details).await.unwrap(),
            ProvisionedWorkerStatus::Succeeded
        );
        em.teardown_worker(&details).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_procedure_name_is_rejected_upfront() {
        let em = manager();
        let err = em
            .provision_and_start_execution(&request("drop table x;"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
