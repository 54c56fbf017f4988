pub mod error;
pub mod event;
pub mod pipeline;
pub mod resource_manager;
pub mod task;
