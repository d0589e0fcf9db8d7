//! 任务引擎：判定 → 分解 → 调度，产出任务事件流
//!
//! 每次 execute_task / resume_task 都在独立的 tokio 任务里运行（见 run.rs），事件经有界 channel
//! 推给调用方。同一任务的步骤串行执行，并发只发生在单个步骤的工具批次内部。
//! 取消是协作式的：在下一个检查点（开始下一步骤前、等待用户响应或退避期间）生效。

pub mod builder;
pub mod events;
mod run;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{stream, Stream};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    EngineError, ErrorRecoveryEngine, InteractionGate, InteractionStats, RecoveryContext,
    RecoveryStats, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use crate::model::{
    validate_todos, Complexity, ExecutionContext, Task, TaskResult, TaskStatus, TaskSubmission,
};
use crate::oracle::ComplexityOracle;
use crate::state::{RecoveryInfo, StateManager};
use crate::tools::{LifecycleStatistics, ToolLifecycleRegistry, ToolOrchestrator};

pub use builder::EngineBuilder;
pub use events::EventType;

use events::event;
use run::TaskRun;

/// 任务事件流
pub type TaskResultStream = Pin<Box<dyn Stream<Item = TaskResult> + Send>>;

/// 正在运行的任务
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTaskInfo {
    pub task_id: String,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub resumed: bool,
}

struct ActiveTask {
    info: ActiveTaskInfo,
    cancel: CancellationToken,
}

impl ActiveTask {
    fn new(task_id: &str, query: &str, resumed: bool, cancel: CancellationToken) -> Self {
        Self {
            info: ActiveTaskInfo {
                task_id: task_id.to_string(),
                query: query.to_string(),
                started_at: Utc::now(),
                resumed,
            },
            cancel,
        }
    }
}

/// 单个任务的状态摘要
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub query: String,
    pub status: TaskStatus,
    pub active: bool,
    pub progress: f64,
    pub total_todos: usize,
    pub completed_todos: usize,
    pub failed_todos: usize,
    pub pending_todos: usize,
    pub in_progress_todos: usize,
    pub complexity: Option<Complexity>,
    pub duration_secs: f64,
}

/// 引擎整体状态
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub active_tasks: Vec<ActiveTaskInfo>,
    pub tools: LifecycleStatistics,
    pub recovery: RecoveryStats,
    pub interaction: InteractionStats,
    pub tool_calls_in_flight: usize,
    pub max_parallel_tools: usize,
    pub cached_tasks: usize,
    pub dirty_tasks: usize,
    pub state_backend: &'static str,
    pub shutting_down: bool,
}

/// 引擎内部共享的组件，由 EngineBuilder 组装
struct EngineShared {
    config: AppConfig,
    oracle: Arc<dyn ComplexityOracle>,
    registry: Arc<ToolLifecycleRegistry>,
    orchestrator: Arc<ToolOrchestrator>,
    recovery: Arc<ErrorRecoveryEngine>,
    state: Arc<StateManager>,
    gate: Arc<InteractionGate>,
    shutdown: Arc<ShutdownManager>,
    coordinator: ShutdownCoordinator,
    active: RwLock<HashMap<String, ActiveTask>>,
}

/// 任务引擎；克隆开销很小，所有克隆共享同一组组件
#[derive(Clone)]
pub struct TaskEngine {
    shared: Arc<EngineShared>,
}

fn receiver_stream(rx: mpsc::Receiver<TaskResult>) -> TaskResultStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

impl TaskEngine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ToolLifecycleRegistry> {
        &self.shared.registry
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryEngine> {
        &self.shared.recovery
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.shared.state
    }

    pub fn interaction(&self) -> &Arc<InteractionGate> {
        &self.shared.gate
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shared.shutdown
    }

    fn channel(&self) -> (mpsc::Sender<TaskResult>, mpsc::Receiver<TaskResult>) {
        mpsc::channel(self.shared.config.app.event_buffer.max(1))
    }

    fn default_workspace(&self) -> PathBuf {
        self.shared.config.app.workspace()
    }

    /// 提交新任务，返回事件流；流在终止事件之后结束
    pub async fn execute_task(&self, query: &str, submission: Option<TaskSubmission>) -> TaskResultStream {
        let (tx, rx) = self.channel();
        if self.shared.shutdown.is_shutdown() {
            let _ = tx
                .send(TaskResult::new(
                    EventType::TaskFailed.as_str(),
                    None,
                    json!({
                        "error": EngineError::Shutdown.to_string(),
                        "error_kind": "system",
                        "message": "Engine is shutting down, task was not started",
                    }),
                ))
                .await;
            return receiver_stream(rx);
        }

        let mut task = Task::new(query);
        let submission = submission.unwrap_or_default();
        if let Some(session) = &submission.session_id {
            task.metadata.insert("session_id".into(), json!(session));
        }
        if let Some(user) = &submission.user_id {
            task.metadata.insert("user_id".into(), json!(user));
        }
        let ctx = ExecutionContext::from_submission(
            task.id.clone(),
            self.default_workspace(),
            self.shared.config.task.max_execution_time_secs,
            submission,
        );
        if let Ok(v) = serde_json::to_value(&ctx) {
            task.metadata.insert("execution_context".into(), v);
        }

        tracing::info!(task_id = %task.id, query = %query, "task submitted");
        let cancel = self.register_active(&task, false).await;
        let run = TaskRun::new(self.clone(), task, Arc::new(ctx), tx, cancel);
        tokio::spawn(run.run_new());
        receiver_stream(rx)
    }

    /// 从持久化状态恢复任务；任务不存在或不可恢复时流里只有一个 task_resume_failed
    pub async fn resume_task(&self, task_id: &str) -> TaskResultStream {
        let (tx, rx) = self.channel();
        match self.load_resumable(task_id).await {
            Ok((task, cancel)) => {
                let ctx = task
                    .metadata
                    .get("execution_context")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<ExecutionContext>(v).ok())
                    .unwrap_or_else(|| {
                        let mut ctx = ExecutionContext::new(task.id.clone(), self.default_workspace());
                        ctx.max_execution_time_secs = self.shared.config.task.max_execution_time_secs;
                        ctx
                    });
                tracing::info!(task_id = %task.id, progress = task.progress_percentage(), "resuming task");
                let run = TaskRun::new(self.clone(), task, Arc::new(ctx), tx, cancel);
                tokio::spawn(run.run_resumed());
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "task cannot be resumed");
                let outcome = self
                    .shared
                    .recovery
                    .handle(&e, &RecoveryContext::new(task_id))
                    .await;
                let suggestions = match self.shared.state.recovery_info(task_id).await {
                    Ok(Some(info)) if !matches!(e, EngineError::Graph(_)) => info.suggestions,
                    _ => outcome.suggestions.clone(),
                };
                let _ = tx
                    .send(event(
                        EventType::TaskResumeFailed,
                        task_id,
                        json!({
                            "error": e.to_string(),
                            "error_kind": outcome.error_kind,
                            "message": format!("Task {} cannot be resumed", task_id),
                            "suggestions": suggestions,
                        }),
                    ))
                    .await;
            }
        }
        receiver_stream(rx)
    }

    /// 先占住 active 槽位再加载，同一任务的并发恢复只有一个能通过
    async fn load_resumable(&self, task_id: &str) -> Result<(Task, CancellationToken), EngineError> {
        if self.shared.shutdown.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        let cancel = self.reserve_active(task_id, "", true).await?;
        match self.load_stored(task_id).await {
            Ok(task) => {
                if let Some(active) = self.shared.active.write().await.get_mut(task_id) {
                    active.info.query = task.query.clone();
                }
                Ok((task, cancel))
            }
            Err(e) => {
                self.shared.active.write().await.remove(task_id);
                Err(e)
            }
        }
    }

    async fn load_stored(&self, task_id: &str) -> Result<Task, EngineError> {
        let task = self
            .shared
            .state
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if !task.is_resumable() {
            return Err(EngineError::NotResumable {
                id: task.id.clone(),
                status: task.status,
            });
        }
        validate_todos(&task.todo_list)?;
        Ok(task)
    }

    async fn register_active(&self, task: &Task, resumed: bool) -> CancellationToken {
        let cancel = self.shared.shutdown.token().child_token();
        self.shared
            .active
            .write()
            .await
            .insert(task.id.clone(), ActiveTask::new(&task.id, &task.query, resumed, cancel.clone()));
        cancel
    }

    /// 检查与插入在同一把写锁内完成
    async fn reserve_active(
        &self,
        task_id: &str,
        query: &str,
        resumed: bool,
    ) -> Result<CancellationToken, EngineError> {
        let mut active = self.shared.active.write().await;
        if active.contains_key(task_id) {
            return Err(EngineError::Validation(format!("Task {} is already running", task_id)));
        }
        let cancel = self.shared.shutdown.token().child_token();
        active.insert(
            task_id.to_string(),
            ActiveTask::new(task_id, query, resumed, cancel.clone()),
        );
        Ok(cancel)
    }

    async fn release_active(&self, task_id: &str) {
        self.shared.active.write().await.remove(task_id);
        self.shared.gate.cleanup_task(task_id).await;
    }

    /// 对 user_interaction_required 事件的响应；未知 event_id 返回 false
    pub async fn submit_user_response(
        &self,
        event_id: &str,
        action: &str,
        data: Option<Map<String, Value>>,
    ) -> bool {
        self.shared.gate.submit_response(event_id, action, data).await
    }

    /// 请求在下一个步骤开始前中断；任务不在运行时返回 false
    pub async fn request_interruption(&self, task_id: &str) -> bool {
        if !self.shared.active.read().await.contains_key(task_id) {
            return false;
        }
        self.shared.gate.request_interruption(task_id).await
    }

    /// 取消任务：运行中的任务在下一个检查点停止；未运行但可恢复的任务直接标记为取消
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        if let Some(active) = self.shared.active.read().await.get(task_id) {
            tracing::info!(task_id = %task_id, "cancellation requested");
            active.cancel.cancel();
            return true;
        }
        match self.shared.state.get(task_id).await {
            Ok(Some(mut task)) if task.is_resumable() => {
                task.cancel();
                task.touch();
                if let Err(e) = self.shared.state.save(&task, true).await {
                    tracing::error!(task_id = %task_id, error = %e, "failed to persist cancelled task");
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "cancel lookup failed");
                false
            }
        }
    }

    pub async fn active_tasks(&self) -> Vec<ActiveTaskInfo> {
        let mut tasks: Vec<ActiveTaskInfo> = self
            .shared
            .active
            .read()
            .await
            .values()
            .map(|a| a.info.clone())
            .collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    pub async fn task_status(&self, task_id: &str) -> Result<Option<TaskStatusReport>, EngineError> {
        let Some(task) = self.shared.state.get(task_id).await? else {
            return Ok(None);
        };
        let active = self.shared.active.read().await.contains_key(task_id);
        Ok(Some(TaskStatusReport {
            task_id: task.id.clone(),
            query: task.query.clone(),
            status: task.status,
            active,
            progress: task.progress_percentage(),
            total_todos: task.todo_list.len(),
            completed_todos: task.completed_todos().len(),
            failed_todos: task.failed_todos().len(),
            pending_todos: task.pending_todos().len(),
            in_progress_todos: task.in_progress_todos().len(),
            duration_secs: task.duration_secs(),
            complexity: task.complexity.clone(),
        }))
    }

    pub async fn recovery_info(&self, task_id: &str) -> Result<Option<RecoveryInfo>, EngineError> {
        Ok(self.shared.state.recovery_info(task_id).await?)
    }

    pub async fn system_status(&self) -> SystemStatus {
        let scheduler = self.shared.orchestrator.executor().scheduler();
        SystemStatus {
            active_tasks: self.active_tasks().await,
            tools: self.shared.registry.statistics().await,
            recovery: self.shared.recovery.statistics().await,
            interaction: self.shared.gate.statistics().await,
            tool_calls_in_flight: scheduler.in_flight(),
            max_parallel_tools: scheduler.max_concurrent_tools(),
            cached_tasks: self.shared.state.cached_count().await,
            dirty_tasks: self.shared.state.dirty_count().await,
            state_backend: self.shared.state.store().name(),
            shutting_down: self.shared.shutdown.is_shutdown(),
        }
    }

    /// 关闭引擎：运行中的任务在检查点暂停并落盘，随后停止后台循环、刷出状态、卸载工具
    pub async fn shutdown(&self) {
        tracing::info!("task engine shutting down");
        self.shared.shutdown.shutdown(ShutdownReason::EngineShutdown);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.shared.active.read().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.shared.active.read().await.len();
                tracing::warn!(
                    remaining = remaining,
                    "tasks still running at shutdown deadline"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.shared.orchestrator.executor().scheduler().close();
        self.shared.coordinator.run_cleanup().await;
    }
}
