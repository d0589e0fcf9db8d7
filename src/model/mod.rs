//! 数据模型：Task / TodoItem 状态机、依赖图校验、分解草稿、执行期类型

pub mod execution;
pub mod graph;
pub mod plan;
pub mod task;

pub use execution::{
    ExecutionContext, ExecutionPlan, ExecutionStrategy, TaskResult, TaskSubmission, ToolCall,
    ToolExecutionBatch, ToolResult, UserInteractionEvent, UserInteractionResponse,
};
pub use graph::{topological_order, validate_todos, GraphError};
pub use plan::{DraftDependency, PlanEdit, StepModification, TodoDraft};
pub use task::{Complexity, Task, TaskStatus, TodoItem};
