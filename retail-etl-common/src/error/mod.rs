use std::fmt::Debug;

mod worker;
pub use worker::WorkerError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    #[error("Task Execution Error: {0}")]
    TaskExecution(String),

    #[error("Warehouse Error: {0}")]
    Warehouse(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Internal Error: {0}")]
    Internal(String),

    #[error("Conflict Error: {0}")]
    Conflict(String),
}
