//! 任务事件类型与构造
//!
//! 事件流里每一项都是 TaskResult，`type` 字段取自 EventType。

use serde_json::{json, Value};

use crate::core::{EngineError, ErrorKind, RecoveryOutcome};
use crate::model::{Task, TaskResult, TodoItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    TaskAnalysisStarted,
    ComplexityAnalysisCompleted,
    TaskDecompositionStarted,
    TodoListGenerated,
    TodoStarted,
    ToolExecutionResult,
    TodoCompleted,
    TodoFailed,
    TaskModified,
    TaskAborted,
    TaskPaused,
    UserInteractionRequired,
    UserInteractionResponse,
    TaskCompleted,
    TaskFailed,
    TaskResumed,
    TaskResumeFailed,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskAnalysisStarted => "task_analysis_started",
            EventType::ComplexityAnalysisCompleted => "complexity_analysis_completed",
            EventType::TaskDecompositionStarted => "task_decomposition_started",
            EventType::TodoListGenerated => "todo_list_generated",
            EventType::TodoStarted => "todo_started",
            EventType::ToolExecutionResult => "tool_execution_result",
            EventType::TodoCompleted => "todo_completed",
            EventType::TodoFailed => "todo_failed",
            EventType::TaskModified => "task_modified",
            EventType::TaskAborted => "task_aborted",
            EventType::TaskPaused => "task_paused",
            EventType::UserInteractionRequired => "user_interaction_required",
            EventType::UserInteractionResponse => "user_interaction_response",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::TaskResumed => "task_resumed",
            EventType::TaskResumeFailed => "task_resume_failed",
            EventType::Warning => "warning",
        }
    }
}

pub fn event(kind: EventType, task_id: &str, data: Value) -> TaskResult {
    TaskResult::new(kind.as_str(), Some(task_id), data)
}

pub fn todo_event(kind: EventType, task_id: &str, todo_id: &str, data: Value) -> TaskResult {
    event(kind, task_id, data).with_todo(todo_id)
}

/// 步骤列表摘要，用于 todo_list_generated / task_modified
pub fn todo_list_payload(task: &Task) -> Value {
    let todos: Vec<Value> = task
        .todo_list
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "content": t.content,
                "status": t.status,
                "tools_needed": t.tools_needed,
                "dependencies": t.dependencies,
                "priority": t.priority,
                "estimated_duration": t.estimated_duration,
            })
        })
        .collect();
    json!({
        "count": todos.len(),
        "todos": todos,
        "progress": task.progress_percentage(),
    })
}

pub fn todo_started_payload(todo: &TodoItem) -> Value {
    json!({
        "content": todo.content,
        "tools_needed": todo.tools_needed,
        "priority": todo.priority,
        "attempt": todo.attempt(),
    })
}

/// 失败事件的公共部分：可读消息、分类、建议与恢复结果
pub fn failure_payload(error: &EngineError, outcome: &RecoveryOutcome) -> Value {
    json!({
        "error": error.to_string(),
        "error_kind": outcome.error_kind,
        "message": outcome.message,
        "suggestions": outcome.suggestions,
        "recovery": outcome,
    })
}

/// 未经过恢复引擎的任务级失败（停滞、步骤未解析）
pub fn anomaly_payload(kind: ErrorKind, message: &str, task: &Task) -> Value {
    json!({
        "error": message,
        "error_kind": kind,
        "message": message,
        "progress": task.progress_percentage(),
        "duration": task.duration_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_carries_type_and_todo() {
        let e = todo_event(EventType::TodoStarted, "t1", "a", json!({"attempt": 1}));
        assert_eq!(e.kind, "todo_started");
        assert_eq!(e.task_id.as_deref(), Some("t1"));
        assert_eq!(e.todo_id.as_deref(), Some("a"));
        assert!(!e.is_terminal());
        assert!(event(EventType::TaskPaused, "t1", Value::Null).is_terminal());
    }

    #[test]
    fn test_todo_list_payload() {
        let mut task = Task::new("q");
        task.todo_list = vec![TodoItem::new("a"), TodoItem::new("b")];
        let v = todo_list_payload(&task);
        assert_eq!(v["count"], 2);
        assert_eq!(v["todos"][1]["content"], "b");
        assert_eq!(v["todos"][0]["status"], "pending");
    }
}
