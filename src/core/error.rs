//! 引擎错误类型、错误分类与恢复策略
//!
//! 与 ErrorRecoveryEngine 配合：EngineError::kind_hint 先按错误种类给出分类，命中不了再交给关键字表。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::graph::GraphError;
use crate::model::TaskStatus;
use crate::state::StateError;
use crate::tools::RegistryError;

/// 执行过程中可能出现的错误（工具、权限、校验、存储、调度等）
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecutionFailed { tool: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Circuit breaker open for tool: {0}")]
    CircuitOpen(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("File error: {0}")]
    FileSystem(String),

    #[error("Decomposition error: {0}")]
    Graph(#[from] GraphError),

    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Tool registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {id} cannot be resumed from status {status}")]
    NotResumable { id: String, status: TaskStatus },

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Engine is shutting down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// 按错误种类直接得出的分类；None 表示需要关键字匹配
    pub fn kind_hint(&self) -> Option<ErrorKind> {
        match self {
            EngineError::ToolTimeout(_) => Some(ErrorKind::Timeout),
            EngineError::PermissionDenied(_) => Some(ErrorKind::Permission),
            EngineError::Validation(_) | EngineError::Graph(_) | EngineError::Json(_) => {
                Some(ErrorKind::Validation)
            }
            EngineError::NotResumable { .. } | EngineError::TaskNotFound(_) => {
                Some(ErrorKind::Validation)
            }
            EngineError::Network(_) => Some(ErrorKind::Network),
            EngineError::FileSystem(_) => Some(ErrorKind::FileSystem),
            EngineError::Io(e) => Some(match e.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => ErrorKind::Network,
                _ => ErrorKind::FileSystem,
            }),
            EngineError::ToolNotFound(_)
            | EngineError::CircuitOpen(_)
            | EngineError::Registry(_) => Some(ErrorKind::Tool),
            EngineError::State(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::Cancelled(_)
            | EngineError::Shutdown => Some(ErrorKind::System),
            // 工具自身返回的错误文本需要再做关键字分类
            EngineError::ToolExecutionFailed { .. } | EngineError::Other(_) => None,
        }
    }

    /// 错误涉及的工具名（用于熔断与恢复上下文）
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            EngineError::ToolTimeout(t)
            | EngineError::ToolNotFound(t)
            | EngineError::CircuitOpen(t) => Some(t),
            EngineError::ToolExecutionFailed { tool, .. } => Some(tool),
            _ => None,
        }
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Permission,
    Timeout,
    Network,
    FileSystem,
    Tool,
    System,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::FileSystem => "file_system",
            ErrorKind::Tool => "tool",
            ErrorKind::System => "system",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复引擎为某类错误选择的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// 指数退避后重试
    Retry,
    /// 降级到默认行为
    Fallback,
    /// 跳过该步骤（带警告视为完成）
    Skip,
    /// 终止并传播失败
    Abort,
    /// 给出可操作建议，等待人工处理
    Manual,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Abort => "abort",
            RecoveryStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
