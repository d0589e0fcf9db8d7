//! 执行期数据：上下文、工具调用与结果、批次与计划、事件、交互
//!
//! ExecutionContext 每次任务运行创建一次，以 `Arc` 在编排器与工具之间只读共享。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 调用方提交任务时附带的上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub allow_network: Option<bool>,
    #[serde(default)]
    pub allow_file_write: Option<bool>,
}

/// 单次任务运行的只读执行上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub session_id: String,
    pub task_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub permissions: HashSet<String>,
    pub allow_network: bool,
    pub allow_file_write: bool,
    pub max_execution_time_secs: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            user_id: None,
            working_directory: working_directory.into(),
            environment: HashMap::new(),
            permissions: HashSet::new(),
            allow_network: true,
            allow_file_write: true,
            max_execution_time_secs: 300,
            metadata: Map::new(),
        }
    }

    /// 合并调用方上下文；未给出的字段保持默认
    pub fn from_submission(
        task_id: impl Into<String>,
        default_dir: PathBuf,
        max_execution_time_secs: u64,
        submission: TaskSubmission,
    ) -> Self {
        let mut ctx = Self::new(task_id, submission.working_directory.unwrap_or(default_dir));
        if let Some(session) = submission.session_id {
            ctx.session_id = session;
        }
        ctx.user_id = submission.user_id;
        ctx.environment = submission.environment;
        ctx.permissions = submission.permissions.into_iter().collect();
        ctx.allow_network = submission.allow_network.unwrap_or(true);
        ctx.allow_file_write = submission.allow_file_write.unwrap_or(true);
        ctx.max_execution_time_secs = max_execution_time_secs;
        ctx
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// 工具声明的权限是否都满足；网络与写入另由开关控制
    pub fn grants(&self, required: &[String]) -> bool {
        required.iter().all(|p| match p.as_str() {
            "network" => self.allow_network,
            "file_write" => self.allow_file_write,
            other => self.has_permission(other),
        })
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }
}

/// 一次工具调用请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            parameters,
            created_at: Utc::now(),
        }
    }
}

/// 一次工具调用的不可变结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, data: Value, execution_time_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn err(call: &ToolCall, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time_ms,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Parallel,
    Sequential,
}

/// 同一执行策略下的一组工具调用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionBatch {
    pub id: String,
    pub calls: Vec<ToolCall>,
    pub strategy: ExecutionStrategy,
    pub is_concurrency_safe: bool,
    /// 必须先完成的批次 id
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub estimated_duration_secs: f64,
}

impl ToolExecutionBatch {
    pub fn new(calls: Vec<ToolCall>, strategy: ExecutionStrategy, estimated_duration_secs: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            calls,
            is_concurrency_safe: strategy == ExecutionStrategy::Parallel,
            strategy,
            dependencies: Vec::new(),
            estimated_duration_secs,
        }
    }
}

/// 一个 TodoItem 的执行计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub task_id: String,
    pub todo_id: Option<String>,
    pub batches: Vec<ToolExecutionBatch>,
    pub total_estimated_duration_secs: f64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(task_id: &str, todo_id: Option<&str>, batches: Vec<ToolExecutionBatch>) -> Self {
        let total = batches.iter().map(|b| b.estimated_duration_secs).sum();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            todo_id: todo_id.map(str::to_string),
            batches,
            total_estimated_duration_secs: total,
            created_at: Utc::now(),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.batches.iter().map(|b| b.calls.len()).sum()
    }

    /// 依赖已满足且尚未完成的批次，保持声明顺序
    pub fn ready_batches(&self, completed: &HashSet<String>) -> Vec<&ToolExecutionBatch> {
        self.batches
            .iter()
            .filter(|b| !completed.contains(&b.id))
            .filter(|b| b.dependencies.iter().all(|d| completed.contains(d)))
            .collect()
    }
}

/// 任务事件流中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub task_id: Option<String>,
    #[serde(default)]
    pub todo_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskResult {
    pub fn new(kind: impl Into<String>, task_id: Option<&str>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            task_id: task_id.map(str::to_string),
            todo_id: None,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_todo(mut self, todo_id: &str) -> Self {
        self.todo_id = Some(todo_id.to_string());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind.as_str(),
            "task_completed" | "task_failed" | "task_aborted" | "task_paused" | "task_resume_failed"
        )
    }
}

/// 需要用户参与的交互事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInteractionEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub response_required: bool,
    pub timeout_secs: u64,
}

/// 用户对交互事件的响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInteractionResponse {
    pub event_id: String,
    pub action: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}
