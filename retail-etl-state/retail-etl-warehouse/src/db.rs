use std::{fmt, sync::Arc};

use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use tracing::{error, info, warn};

use crate::{config::WarehouseConfig, error::WarehouseError, procedure::ProcedureName};

/// Opens and releases the connection a single procedure call runs on.
#[async_trait]
pub trait WarehouseConnector: fmt::Debug + Send + Sync {
    async fn connect(
        &self,
        config: &WarehouseConfig,
    ) -> Result<DatabaseConnection, WarehouseError>;

    async fn release(&self, conn: DatabaseConnection) -> Result<(), DbErr> {
        conn.close().await
    }
}

/// Connects with a single-connection pool built from the configuration.
#[derive(Debug, Default)]
pub struct PooledConnector;

#[async_trait]
impl WarehouseConnector for PooledConnector {
    async fn connect(
        &self,
        config: &WarehouseConfig,
    ) -> Result<DatabaseConnection, WarehouseError> {
        let mut opt = ConnectOptions::new(config.connection_url()?);
        opt.max_connections(1)
            .min_connections(0)
            .connect_timeout(config.connect_timeout)
            .acquire_timeout(config.connect_timeout)
            .sqlx_logging(false);

        Database::connect(opt)
            .await
            .map_err(|source| WarehouseError::Connect {
                target: config.target(),
                source,
            })
    }
}

/// Entry point to the warehouse. Holds configuration only; every call opens
/// its own connection and releases it before returning.
#[derive(Debug, Clone)]
pub struct WarehouseDb {
    config: WarehouseConfig,
    connector: Arc<dyn WarehouseConnector>,
}

impl WarehouseDb {
    pub fn new(config: WarehouseConfig) -> Self {
        Self::with_connector(config, Arc::new(PooledConnector))
    }

    pub fn with_connector(config: WarehouseConfig, connector: Arc<dyn WarehouseConnector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    /// Calls `procedure` with no arguments on a fresh connection.
    /// ---
    /// The connection is released on both the success and the failure path.
    /// Errors are logged and then returned unchanged. Nothing is retried
    /// and each call runs the procedure again.
    pub async fn call_procedure(&self, procedure: &ProcedureName) -> Result<(), WarehouseError> {
        info!("Connecting to warehouse at {}", self.config.target());

        let conn = match self.connector.connect(&self.config).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Error connecting to warehouse: {}", e);
                return Err(e);
            }
        };

        info!("Executing stored procedure: {}", procedure);
        let result = conn.execute_unprepared(&procedure.call_statement()).await;

        if let Err(e) = self.connector.release(conn).await {
            warn!("Failed to close warehouse connection cleanly: {}", e);
        }

        match result {
            Ok(_) => {
                info!("Stored procedure {} completed", procedure);
                Ok(())
            }
            Err(source) => {
                let err = WarehouseError::Procedure {
                    procedure: procedure.to_string(),
                    source,
                };
                error!("Error executing stored procedure: {}", err);
                Err(err)
            }
        }
    }

    /// Calls the procedure named in the configuration.
    pub async fn load(&self) -> Result<(), WarehouseError> {
        let procedure = self.config.procedure.clone();
        self.call_procedure(&procedure).await
    }
}
