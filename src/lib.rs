//! Taskforge - 任务执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、熔断、恢复策略、交互闸门、并发许可、优雅关闭
//! - **model**: Task / TodoItem 状态机、依赖图、执行期类型
//! - **oracle**: 复杂度判定与任务分解（外部判定器适配 + 规则兜底）
//! - **tools**: 工具契约、生命周期注册表、执行器与编排器
//! - **state**: 任务状态持久化（文件 / SQLite）与 StateManager
//! - **engine**: TaskEngine，产出任务事件流，支持恢复与中断
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod engine;
pub mod model;
pub mod observability;
pub mod oracle;
pub mod state;
pub mod tools;

pub use config::{load_config, AppConfig};
pub use engine::{EngineBuilder, EventType, TaskEngine, TaskResultStream};
pub use model::{Task, TaskResult, TaskStatus, TaskSubmission, TodoItem};
