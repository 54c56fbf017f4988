pub mod config;
pub mod db;
pub mod error;
pub mod ex_mgr;
pub mod procedure;

pub use config::{Backend, WarehouseConfig};
pub use db::{PooledConnector, WarehouseConnector, WarehouseDb};
pub use error::WarehouseError;
pub use ex_mgr::StoredProcedureExecutionManager;
pub use procedure::ProcedureName;
