pub mod default;
mod exec_manager;
mod worker_table;

pub use default::*;
pub use exec_manager::*;
pub use worker_table::*;
