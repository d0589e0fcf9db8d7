//! Task / TodoItem 数据模型与状态机
//!
//! 状态机：`Pending -> InProgress -> {Completed | Failed}`，`Pending|InProgress -> Cancelled`。
//! 终态只能通过 `TodoItem::reset_for_retry` 离开：旧的一次尝试写入 metadata.attempts，再开始新的 Pending。
//! Task.status 由 `update_status` 从 TodoItem 状态推导；显式取消的 Task 不会被覆盖。

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::EngineError;

/// Task 与 TodoItem 共用的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Pending, Cancelled)
                | (InProgress, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 复杂度判定结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complexity {
    /// 1..=10
    pub score: u8,
    pub needs_decomposition: bool,
    /// >= 1
    pub estimated_steps: u32,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl Complexity {
    /// 判定失败时使用的保守默认值
    pub fn conservative_default() -> Self {
        Self {
            score: 3,
            needs_decomposition: true,
            estimated_steps: 3,
            required_capabilities: vec!["general_processor".to_string()],
            reasoning: "Complexity analysis unavailable, using conservative default".to_string(),
        }
    }

    /// 把字段收敛到合法范围
    pub fn clamped(mut self) -> Self {
        self.score = self.score.clamp(1, 10);
        self.estimated_steps = self.estimated_steps.max(1);
        self
    }
}

/// 一个分解后的步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// 需要的能力名
    #[serde(default)]
    pub tools_needed: Vec<String>,
    /// 同一 Task 内的 TodoItem id
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 越大越先执行
    #[serde(default)]
    pub priority: i32,
    /// 预估耗时（秒）
    #[serde(default)]
    pub estimated_duration: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TodoItem {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            status: TaskStatus::Pending,
            tools_needed: Vec::new(),
            dependencies: Vec::new(),
            priority: 0,
            estimated_duration: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: Map::new(),
        }
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools_needed = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_started(&mut self) -> Result<(), EngineError> {
        self.transition(TaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), EngineError> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: &str) -> Result<(), EngineError> {
        self.transition(TaskStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        if !reason.is_empty() {
            self.metadata
                .insert("failure_reason".into(), Value::String(reason.to_string()));
        }
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), EngineError> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// 当前尝试序号（从 1 开始）
    pub fn attempt(&self) -> u32 {
        self.metadata
            .get("attempts")
            .and_then(Value::as_array)
            .map_or(0, |a| a.len() as u32)
            + 1
    }

    /// 开始新的一次尝试：归档当前尝试，回到 Pending；已完成的项不能重置
    pub fn reset_for_retry(&mut self) -> Result<(), EngineError> {
        if matches!(self.status, TaskStatus::Pending | TaskStatus::Completed) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.archive_attempt();
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// 失败后按恢复策略（跳过 / 降级）以带警告的完成收尾，失败记录保留在 attempts 中
    pub fn complete_with_warning(&mut self, warning: &str) -> Result<(), EngineError> {
        if self.status != TaskStatus::Failed {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: TaskStatus::Completed,
            });
        }
        let started_at = self.started_at;
        self.archive_attempt();
        self.status = TaskStatus::Completed;
        self.started_at = started_at;
        self.completed_at = Some(Utc::now());
        self.metadata
            .insert("warning".into(), Value::String(warning.to_string()));
        Ok(())
    }

    /// 没有可用工具：退回 Pending，不计入尝试次数
    pub fn mark_unresolved(&mut self, capabilities: &[String]) -> Result<(), EngineError> {
        if self.status != TaskStatus::InProgress {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.metadata
            .insert("unresolved_capabilities".into(), json!(capabilities));
        Ok(())
    }

    fn archive_attempt(&mut self) {
        let record = json!({
            "attempt": self.attempt(),
            "status": self.status,
            "reason": self.metadata.remove("failure_reason"),
            "started_at": self.started_at,
            "completed_at": self.completed_at,
        });
        match self.metadata.get_mut("attempts").and_then(Value::as_array_mut) {
            Some(list) => list.push(record),
            None => {
                self.metadata
                    .insert("attempts".into(), Value::Array(vec![record]));
            }
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.metadata.get("failure_reason").and_then(Value::as_str)
    }

    /// 执行耗时（秒）
    pub fn execution_duration(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(e)) => Some((e - s).num_seconds()),
            _ => None,
        }
    }
}

/// 一个用户级任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub query: String,
    pub description: String,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub todo_list: Vec<TodoItem>,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            id: Uuid::new_v4().to_string(),
            description: query.clone(),
            query,
            complexity: None,
            todo_list: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: Map::new(),
        }
    }

    pub fn todo(&self, id: &str) -> Option<&TodoItem> {
        self.todo_list.iter().find(|t| t.id == id)
    }

    pub fn todo_mut(&mut self, id: &str) -> Option<&mut TodoItem> {
        self.todo_list.iter_mut().find(|t| t.id == id)
    }

    fn todos_with(&self, status: TaskStatus) -> Vec<&TodoItem> {
        self.todo_list.iter().filter(|t| t.status == status).collect()
    }

    pub fn pending_todos(&self) -> Vec<&TodoItem> {
        self.todos_with(TaskStatus::Pending)
    }

    pub fn in_progress_todos(&self) -> Vec<&TodoItem> {
        self.todos_with(TaskStatus::InProgress)
    }

    pub fn completed_todos(&self) -> Vec<&TodoItem> {
        self.todos_with(TaskStatus::Completed)
    }

    pub fn failed_todos(&self) -> Vec<&TodoItem> {
        self.todos_with(TaskStatus::Failed)
    }

    /// 依赖全部完成的 Pending 项，按优先级降序，同优先级保持插入顺序
    pub fn ready_todos(&self) -> Vec<&TodoItem> {
        let completed: HashSet<&str> = self
            .todo_list
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        let mut ready: Vec<&TodoItem> = self
            .todo_list
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d.as_str())))
            .collect();
        // sort_by 是稳定排序
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
    }

    /// 还有 Pending 项但没有一个就绪
    pub fn is_stalled(&self) -> bool {
        !self.pending_todos().is_empty() && self.ready_todos().is_empty()
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.todo_list.is_empty() {
            return 0.0;
        }
        self.completed_todos().len() as f64 / self.todo_list.len() as f64 * 100.0
    }

    /// 从 TodoItem 状态重算 Task.status；幂等，只改 status 与时间戳
    pub fn update_status(&mut self) {
        if self.status == TaskStatus::Cancelled || self.todo_list.is_empty() {
            return;
        }
        let statuses: Vec<TaskStatus> = self.todo_list.iter().map(|t| t.status).collect();
        let any = |s: TaskStatus| statuses.contains(&s);

        let status = if statuses.iter().all(|s| *s == TaskStatus::Completed) {
            TaskStatus::Completed
        } else if any(TaskStatus::Failed) {
            TaskStatus::Failed
        } else if statuses
            .iter()
            .all(|s| matches!(s, TaskStatus::Completed | TaskStatus::Cancelled))
        {
            TaskStatus::Cancelled
        } else if any(TaskStatus::InProgress) || any(TaskStatus::Completed) {
            TaskStatus::InProgress
        } else {
            TaskStatus::Pending
        };

        self.status = status;
        if status != TaskStatus::Pending && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            if self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        } else {
            self.completed_at = None;
        }
    }

    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::InProgress;
        }
    }

    /// 显式取消：未结束的 TodoItem 一并取消
    pub fn cancel(&mut self) {
        for todo in &mut self.todo_list {
            if !todo.status.is_terminal() {
                let _ = todo.cancel();
            }
        }
        self.status = TaskStatus::Cancelled;
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// 标记为失败（任务级异常，不依赖 TodoItem 状态）
    pub fn mark_failed(&mut self, reason: &str) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.metadata
            .insert("failure_reason".into(), Value::String(reason.to_string()));
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::InProgress)
    }

    /// 整体替换 TodoList（修改计划），校验通过才生效
    pub fn replace_todo_list(&mut self, todos: Vec<TodoItem>) -> Result<(), EngineError> {
        crate::model::graph::validate_todos(&todos)?;
        self.todo_list = todos;
        self.status = if self.started_at.is_some() {
            TaskStatus::InProgress
        } else {
            TaskStatus::Pending
        };
        self.completed_at = None;
        self.update_status();
        Ok(())
    }

    /// 从开始到结束（或现在）的耗时（秒）
    pub fn duration_secs(&self) -> f64 {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.completed_at.unwrap_or_else(Utc::now);
        ((end - start).num_milliseconds().max(0)) as f64 / 1000.0
    }

    pub fn touch(&mut self) {
        self.metadata
            .insert("updated_at".into(), json!(Utc::now()));
    }
}
