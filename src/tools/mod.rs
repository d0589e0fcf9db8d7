//! 工具层：契约、生命周期注册表、执行器、编排器与内置工具

pub mod contract;
pub mod executor;
pub mod filesystem;
pub mod general;
pub mod orchestrator;
pub mod registry;
pub mod schema;

use std::sync::Arc;

pub use contract::{str_param, Tool, ToolDefinition};
pub use executor::{failure_error, ToolExecutor};
pub use filesystem::{FileReadTool, FileWriteTool, SafeFs};
pub use general::GeneralProcessorTool;
pub use orchestrator::{
    derive_parameters, extract_file_path, infer_capabilities, OrchestratorEvent, TodoOutcome,
    ToolOrchestrator, GENERAL_CAPABILITY,
};
pub use registry::{
    LifecycleCallback, LifecycleEvent, LifecycleEventKind, LifecycleStatistics, RegistryError,
    ToolHealth, ToolLifecycleRegistry, ToolState,
};
pub use schema::{schema_json, schema_value};

/// 内置工具集合
pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(GeneralProcessorTool::new()),
        Arc::new(FileReadTool::new()),
        Arc::new(FileWriteTool::new()),
    ]
}
