use retail_etl_common::error::Error;
use sea_orm::DbErr;

#[derive(thiserror::Error, Debug)]
pub enum WarehouseError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Invalid procedure name '{0}'")]
    InvalidProcedure(String),

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: DbErr,
    },

    #[error("Stored procedure {procedure} failed: {source}")]
    Procedure {
        procedure: String,
        #[source]
        source: DbErr,
    },
}

impl From<WarehouseError> for Error {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::Config(msg) => Error::Config(msg),
            WarehouseError::InvalidProcedure(name) => {
                Error::InvalidInput(format!("Invalid procedure name '{name}'"))
            }
            other => Error::Warehouse(Box::new(other)),
        }
    }
}
