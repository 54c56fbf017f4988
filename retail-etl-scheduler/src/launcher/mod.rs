pub mod default;
pub mod exec_mgr_registry;
pub mod execution_graph;

pub use default::Launcher;
pub use exec_mgr_registry::ExecutionManagerRegistry;
pub use execution_graph::PipelineExecutionGraph;
