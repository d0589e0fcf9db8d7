//! 单个任务的一次运行
//!
//! 状态：AnalyzingComplexity → (Decomposing →) Scheduling → 终止。
//! 调度循环每轮取优先级最高的就绪步骤，先检查中断，再交给编排器执行，失败时走恢复引擎。
//! 每个有意义的状态变化既推送事件，也把任务标脏交给 StateManager。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::FailedTodoPolicy;
use crate::core::recovery::suggestions_for;
use crate::core::{EngineError, ErrorKind, InteractionAction, RecoveryAction, RecoveryContext};
use crate::engine::events::{
    anomaly_payload, event, failure_payload, todo_event, todo_list_payload, todo_started_payload,
    EventType,
};
use crate::engine::TaskEngine;
use crate::model::{
    ExecutionContext, GraphError, PlanEdit, Task, TaskResult, TaskStatus, TodoDraft, TodoItem,
};
use crate::tools::{failure_error, OrchestratorEvent, TodoOutcome};

/// 调度循环的出口
enum Exit {
    /// 没有可执行的步骤了
    Finished,
    Aborted(String),
    Paused(String),
}

enum Step {
    Next,
    Halt,
    Exit(Exit),
}

enum Interruption {
    Proceed,
    Replanned,
    Exit(Exit),
}

pub(super) struct TaskRun {
    engine: TaskEngine,
    task: Task,
    ctx: Arc<ExecutionContext>,
    tx: mpsc::Sender<TaskResult>,
    cancel: CancellationToken,
    /// 本次运行中找不到工具的步骤，不再重复调度
    unresolved: HashSet<String>,
    receiver_gone: bool,
}

impl TaskRun {
    pub(super) fn new(
        engine: TaskEngine,
        task: Task,
        ctx: Arc<ExecutionContext>,
        tx: mpsc::Sender<TaskResult>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            task,
            ctx,
            tx,
            cancel,
            unresolved: HashSet::new(),
            receiver_gone: false,
        }
    }

    pub(super) async fn run_new(mut self) {
        let result = self.plan_and_schedule().await;
        self.conclude(result).await;
    }

    pub(super) async fn run_resumed(mut self) {
        let result = self.resume_and_schedule().await;
        self.conclude(result).await;
    }

    async fn plan_and_schedule(&mut self) -> Result<Exit, EngineError> {
        self.persist().await;
        self.publish(event(
            EventType::TaskAnalysisStarted,
            &self.task.id,
            json!({ "query": self.task.query }),
        ))
        .await;
        self.analyze().await?;
        self.schedule().await
    }

    async fn resume_and_schedule(&mut self) -> Result<Exit, EngineError> {
        let mut reset = 0usize;
        for todo in self
            .task
            .todo_list
            .iter_mut()
            .filter(|t| t.status == TaskStatus::InProgress)
        {
            todo.reset_for_retry()?;
            reset += 1;
        }
        self.task.update_status();

        self.publish(event(
            EventType::TaskResumed,
            &self.task.id,
            json!({
                "progress": self.task.progress_percentage(),
                "remaining_todos": self.task.pending_todos().len(),
                "total_todos": self.task.todo_list.len(),
                "reset_todos": reset,
            }),
        ))
        .await;

        if self.task.todo_list.is_empty() {
            self.analyze().await?;
        }
        self.schedule().await
    }

    /// 判定复杂度并生成步骤列表
    async fn analyze(&mut self) -> Result<(), EngineError> {
        let oracle = self.engine.shared.oracle.clone();
        let complexity = oracle.classify(&self.task.query, &self.ctx).await;
        tracing::info!(
            task_id = %self.task.id,
            score = complexity.score,
            decompose = complexity.needs_decomposition,
            "complexity analysed"
        );
        self.task.complexity = Some(complexity.clone());
        self.publish(event(
            EventType::ComplexityAnalysisCompleted,
            &self.task.id,
            json!(complexity),
        ))
        .await;

        let synthetic = !complexity.needs_decomposition;
        let todos = if synthetic {
            vec![Self::synthetic_todo(&self.task.query)]
        } else {
            self.publish(event(
                EventType::TaskDecompositionStarted,
                &self.task.id,
                json!({ "estimated_steps": complexity.estimated_steps }),
            ))
            .await;
            self.decompose().await?
        };
        self.task.replace_todo_list(todos)?;

        let mut payload = todo_list_payload(&self.task);
        payload["synthetic"] = json!(synthetic);
        self.publish(event(EventType::TodoListGenerated, &self.task.id, payload))
            .await;
        Ok(())
    }

    fn synthetic_todo(query: &str) -> TodoItem {
        let mut todo = TodoItem::new(query);
        todo.metadata.insert("synthetic".into(), json!(true));
        todo
    }

    /// 调用判定器分解并校验；空结果按单步处理
    async fn decompose(&mut self) -> Result<Vec<TodoItem>, EngineError> {
        let capabilities = self.engine.shared.registry.capabilities().await;
        let oracle = self.engine.shared.oracle.clone();
        let drafts = oracle.decompose(&self.task, &capabilities, &self.ctx).await;
        if drafts.is_empty() {
            tracing::warn!(task_id = %self.task.id, "oracle returned no steps, running the query as one step");
            return Ok(vec![Self::synthetic_todo(&self.task.query)]);
        }
        let max = self.engine.shared.config.task.max_todo_items;
        if drafts.len() > max {
            return Err(GraphError::TooManySteps {
                count: drafts.len(),
                max,
            }
            .into());
        }
        Ok(TodoDraft::into_todos(drafts, &[])?)
    }

    /// 先判断关闭：关闭信号同样会触发任务的子 token
    fn checkpoint(&self) -> Option<Exit> {
        if self.engine.shared.shutdown.is_shutdown() {
            Some(Exit::Paused("Engine is shutting down".to_string()))
        } else if self.cancel.is_cancelled() {
            Some(Exit::Aborted("Task cancelled".to_string()))
        } else {
            None
        }
    }

    fn next_ready(&self) -> Option<String> {
        self.task
            .ready_todos()
            .into_iter()
            .find(|t| !self.unresolved.contains(&t.id))
            .map(|t| t.id.clone())
    }

    async fn schedule(&mut self) -> Result<Exit, EngineError> {
        self.task.mark_started();
        loop {
            if let Some(exit) = self.checkpoint() {
                return Ok(exit);
            }
            let Some(todo_id) = self.next_ready() else {
                break;
            };

            let gate = self.engine.shared.gate.clone();
            if gate.check_interruption(&self.task.id).await {
                gate.clear_interruption(&self.task.id).await;
                match self.interrupt(&todo_id).await? {
                    Interruption::Proceed => {}
                    Interruption::Replanned => {
                        self.unresolved.clear();
                        continue;
                    }
                    Interruption::Exit(exit) => return Ok(exit),
                }
                if let Some(exit) = self.checkpoint() {
                    return Ok(exit);
                }
            }

            match self.run_todo(&todo_id).await? {
                Step::Next => {}
                Step::Halt => break,
                Step::Exit(exit) => return Ok(exit),
            }
        }
        Ok(Exit::Finished)
    }

    fn todo_mut(&mut self, todo_id: &str) -> Result<&mut TodoItem, EngineError> {
        self.task
            .todo_mut(todo_id)
            .ok_or_else(|| EngineError::Other(format!("Unknown step: {}", todo_id)))
    }

    async fn run_todo(&mut self, todo_id: &str) -> Result<Step, EngineError> {
        let snapshot = {
            let todo = self.todo_mut(todo_id)?;
            todo.mark_started()?;
            todo.clone()
        };
        self.task.update_status();
        tracing::info!(task_id = %self.task.id, todo_id = %todo_id, content = %snapshot.content, "todo started");
        self.publish(todo_event(
            EventType::TodoStarted,
            &self.task.id,
            todo_id,
            todo_started_payload(&snapshot),
        ))
        .await;

        let outcome = self.execute(&snapshot).await;

        // 任务在调用期间被取消：结果丢弃。引擎关闭时照常记录，下一个检查点再暂停
        if self.cancel.is_cancelled() && !self.engine.shared.shutdown.is_shutdown() {
            tracing::info!(task_id = %self.task.id, todo_id = %todo_id, "discarding result of cancelled step");
            return Ok(Step::Exit(Exit::Aborted("Task cancelled".to_string())));
        }

        if outcome.is_unresolved() {
            self.todo_mut(todo_id)?.mark_unresolved(&outcome.unresolved)?;
            self.unresolved.insert(todo_id.to_string());
            self.task.update_status();
            self.mark_dirty().await;
            tracing::warn!(task_id = %self.task.id, todo_id = %todo_id, "no tool available, step left pending");
            return Ok(Step::Next);
        }

        self.record_results(todo_id, &outcome)?;
        if outcome.succeeded() {
            let todo = self.todo_mut(todo_id)?;
            todo.mark_completed()?;
            let duration = todo.execution_duration();
            self.task.update_status();
            self.publish(todo_event(
                EventType::TodoCompleted,
                &self.task.id,
                todo_id,
                json!({
                    "tool_calls": outcome.results.len(),
                    "duration": duration,
                    "progress": self.task.progress_percentage(),
                }),
            ))
            .await;
            return Ok(Step::Next);
        }

        self.handle_failure(todo_id, &outcome).await
    }

    /// 执行步骤，同时把编排器事件按发生顺序转发出去
    async fn execute(&mut self, todo: &TodoItem) -> TodoOutcome {
        let orchestrator = self.engine.shared.orchestrator.clone();
        let (otx, mut orx) = mpsc::unbounded_channel();
        let ctx = self.ctx.clone();
        let fut = orchestrator.execute_todo(todo, ctx, &otx);
        tokio::pin!(fut);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(ev) = orx.recv() => self.forward(&todo.id, ev).await,
                outcome = &mut fut => break outcome,
            }
        };
        while let Ok(ev) = orx.try_recv() {
            self.forward(&todo.id, ev).await;
        }
        outcome
    }

    async fn forward(&mut self, todo_id: &str, ev: OrchestratorEvent) {
        match ev {
            OrchestratorEvent::ToolFinished(result) => {
                let data = serde_json::to_value(&result).unwrap_or(Value::Null);
                self.publish(todo_event(EventType::ToolExecutionResult, &self.task.id, todo_id, data))
                    .await;
            }
            OrchestratorEvent::Warning {
                message, capability, ..
            } => {
                self.emit(todo_event(
                    EventType::Warning,
                    &self.task.id,
                    todo_id,
                    json!({ "message": message, "capability": capability }),
                ))
                .await;
            }
            other => {
                tracing::debug!(task_id = %self.task.id, todo_id = %todo_id, event = ?other, "orchestrator event");
            }
        }
    }

    fn record_results(&mut self, todo_id: &str, outcome: &TodoOutcome) -> Result<(), EngineError> {
        let results: Vec<Value> = outcome
            .results
            .iter()
            .map(|r| {
                json!({
                    "tool": r.tool_name,
                    "success": r.success,
                    "data": r.data,
                    "error": r.error,
                    "execution_time_ms": r.execution_time_ms,
                })
            })
            .collect();
        let unresolved = outcome.unresolved.clone();
        let todo = self.todo_mut(todo_id)?;
        todo.metadata.insert("results".into(), Value::Array(results));
        if !unresolved.is_empty() {
            todo.metadata
                .insert("unresolved_capabilities".into(), json!(unresolved));
        }
        Ok(())
    }

    async fn handle_failure(&mut self, todo_id: &str, outcome: &TodoOutcome) -> Result<Step, EngineError> {
        let failures = outcome.failures();
        let first = failures.first().copied();
        let err = first
            .and_then(failure_error)
            .unwrap_or_else(|| EngineError::Other("Step produced no successful result".to_string()));
        let tool = first.map(|r| r.tool_name.clone());

        let attempt = {
            let todo = self.todo_mut(todo_id)?;
            let attempt = todo.attempt();
            todo.mark_failed(&err.to_string())?;
            attempt
        };
        self.task.update_status();

        let rctx = RecoveryContext::new(self.task.id.clone())
            .todo(todo_id)
            .tool(tool)
            .attempt(attempt);
        let recovery = self.engine.shared.recovery.handle(&err, &rctx).await;

        let mut data = failure_payload(&err, &recovery);
        data["attempt"] = json!(attempt);
        data["failed_calls"] = json!(failures.len());
        data["breaker_rejected"] = json!(outcome.breaker_rejected());
        data["progress"] = json!(self.task.progress_percentage());
        self.publish(todo_event(EventType::TodoFailed, &self.task.id, todo_id, data))
            .await;

        let task_cfg = &self.engine.shared.config.task;
        let policy = task_cfg.failed_todo_policy;
        let max_attempts = task_cfg.max_retry_attempts;

        match recovery.action {
            RecoveryAction::Skip | RecoveryAction::Fallback => {
                self.todo_mut(todo_id)?.complete_with_warning(&recovery.message)?;
                self.task.update_status();
                self.publish(todo_event(
                    EventType::TodoCompleted,
                    &self.task.id,
                    todo_id,
                    json!({
                        "warning": recovery.message,
                        "recovered": true,
                        "fallback_action": recovery.fallback_action,
                        "progress": self.task.progress_percentage(),
                    }),
                ))
                .await;
                Ok(Step::Next)
            }
            RecoveryAction::Retry if policy == FailedTodoPolicy::Requeue && attempt < max_attempts => {
                if let Some(exit) = self.backoff(recovery.delay()).await {
                    return Ok(Step::Exit(exit));
                }
                self.regenerate(todo_id, &err).await?;
                self.todo_mut(todo_id)?.reset_for_retry()?;
                self.task.update_status();
                self.mark_dirty().await;
                tracing::info!(task_id = %self.task.id, todo_id = %todo_id, next_attempt = attempt + 1, "step requeued");
                Ok(Step::Next)
            }
            _ if policy == FailedTodoPolicy::StopOnFirstFailure => {
                tracing::warn!(task_id = %self.task.id, todo_id = %todo_id, "stopping on first failure");
                Ok(Step::Halt)
            }
            _ => Ok(Step::Next),
        }
    }

    /// 退避等待；期间被取消或关闭时返回出口
    async fn backoff(&self, delay: Duration) -> Option<Exit> {
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
        self.checkpoint()
    }

    /// 让判定器为失败步骤给出替代内容
    async fn regenerate(&mut self, todo_id: &str, err: &EngineError) -> Result<(), EngineError> {
        let snapshot = self.todo_mut(todo_id)?.clone();
        let capabilities = self.engine.shared.registry.capabilities().await;
        let oracle = self.engine.shared.oracle.clone();
        let Some(draft) = oracle
            .regenerate(&snapshot, &err.to_string(), &capabilities)
            .await
        else {
            return Ok(());
        };

        let todo = self.todo_mut(todo_id)?;
        let record = json!({
            "previous_content": todo.content,
            "content": draft.content,
            "tools_needed": draft.tools_needed,
            "at": Utc::now(),
        });
        todo.content = draft.content.clone();
        if !draft.tools_needed.is_empty() {
            todo.tools_needed = draft.tools_needed.clone();
        }
        match todo.metadata.get_mut("regenerations").and_then(Value::as_array_mut) {
            Some(list) => list.push(record),
            None => {
                todo.metadata
                    .insert("regenerations".into(), Value::Array(vec![record]));
            }
        }
        self.publish(todo_event(
            EventType::TaskModified,
            &self.task.id,
            todo_id,
            json!({ "source": "regeneration", "content": draft.content }),
        ))
        .await;
        Ok(())
    }

    /// 处理用户中断：发出交互事件并等待响应
    async fn interrupt(&mut self, next_todo: &str) -> Result<Interruption, EngineError> {
        let gate = self.engine.shared.gate.clone();
        let next = self.task.todo(next_todo).map(|t| t.content.clone());
        let (request, pending) = gate
            .open(
                "user_interruption",
                json!({
                    "reason": "user_interruption",
                    "next_todo": { "id": next_todo, "content": next },
                    "progress": self.task.progress_percentage(),
                    "options": ["continue", "modify", "pause", "abort"],
                }),
                &self.task.id,
                None,
            )
            .await;
        let event_id = request.id.clone();
        self.publish(event(
            EventType::UserInteractionRequired,
            &self.task.id,
            serde_json::to_value(&request).unwrap_or(Value::Null),
        ))
        .await;

        let cancel = self.cancel.clone();
        let response = tokio::select! {
            r = gate.wait_for_response(pending, None) => r,
            _ = cancel.cancelled() => None,
        };
        if let Some(exit) = self.checkpoint() {
            return Ok(Interruption::Exit(exit));
        }

        let Some(response) = response else {
            self.publish(event(
                EventType::UserInteractionResponse,
                &self.task.id,
                json!({ "event_id": event_id, "action": "continue", "timed_out": true }),
            ))
            .await;
            return Ok(Interruption::Proceed);
        };

        self.publish(event(
            EventType::UserInteractionResponse,
            &self.task.id,
            json!({ "event_id": event_id, "action": response.action, "data": response.data }),
        ))
        .await;

        Ok(match InteractionAction::parse(&response.action) {
            InteractionAction::Continue => Interruption::Proceed,
            InteractionAction::Modify => self.modify_plan(response.data.unwrap_or_default()).await?,
            InteractionAction::Pause => Interruption::Exit(Exit::Paused("Paused by user".to_string())),
            InteractionAction::Abort => Interruption::Exit(Exit::Aborted("Aborted by user".to_string())),
            InteractionAction::Other(action) => {
                tracing::warn!(task_id = %self.task.id, action = %action, "unknown interaction action, continuing");
                Interruption::Proceed
            }
        })
    }

    /// data.plan_edit 存在时按编辑修改计划，否则带着 data.feedback 重新分解
    async fn modify_plan(&mut self, data: Map<String, Value>) -> Result<Interruption, EngineError> {
        if let Some(edit) = data.get("plan_edit") {
            let applied = serde_json::from_value::<PlanEdit>(edit.clone())
                .map_err(EngineError::from)
                .and_then(|edit| self.task.apply_plan_edit(edit));
            match applied {
                Ok(()) => {
                    let mut payload = todo_list_payload(&self.task);
                    payload["source"] = json!("plan_edit");
                    self.publish(event(EventType::TaskModified, &self.task.id, payload))
                        .await;
                }
                Err(e) => self.warn(&format!("Plan edit rejected: {}", e)).await,
            }
            return Ok(Interruption::Replanned);
        }

        if let Some(feedback) = data.get("feedback").and_then(Value::as_str) {
            self.task
                .metadata
                .insert("user_feedback".into(), json!(feedback));
        }
        self.publish(event(
            EventType::TaskDecompositionStarted,
            &self.task.id,
            json!({ "reason": "modify" }),
        ))
        .await;
        match self.decompose().await {
            Ok(todos) => {
                self.task.replace_todo_list(todos)?;
                let mut payload = todo_list_payload(&self.task);
                payload["source"] = json!("decomposition");
                self.publish(event(EventType::TaskModified, &self.task.id, payload))
                    .await;
            }
            Err(e) => self.warn(&format!("Re-planning failed, keeping current plan: {}", e)).await,
        }
        Ok(Interruption::Replanned)
    }

    async fn conclude(mut self, result: Result<Exit, EngineError>) {
        match result {
            Ok(Exit::Finished) => self.finish().await,
            Ok(Exit::Aborted(reason)) => self.abort(&reason).await,
            Ok(Exit::Paused(reason)) => self.pause(&reason).await,
            Err(e) => self.fail(e).await,
        }
        // 终止时已强制落盘；写入失败的仍为脏，留在缓存里等下一次刷盘
        if !self.engine.shared.state.evict(&self.task.id).await {
            tracing::debug!(task_id = %self.task.id, "task state kept in cache");
        }
        self.engine.release_active(&self.task.id).await;
    }

    async fn finish(&mut self) {
        self.task.update_status();
        self.persist().await;
        let task_id = self.task.id.clone();

        match self.task.status {
            TaskStatus::Completed => {
                tracing::info!(task_id = %task_id, duration = self.task.duration_secs(), "task completed");
                self.emit(event(
                    EventType::TaskCompleted,
                    &task_id,
                    json!({
                        "duration": self.task.duration_secs(),
                        "progress": self.task.progress_percentage(),
                        "total_todos": self.task.todo_list.len(),
                        "completed_todos": self.task.completed_todos().len(),
                    }),
                ))
                .await;
            }
            TaskStatus::Failed => {
                let failed: Vec<Value> = self
                    .task
                    .failed_todos()
                    .iter()
                    .map(|t| json!({ "id": t.id, "content": t.content, "reason": t.failure_reason() }))
                    .collect();
                let kind = self
                    .task
                    .failed_todos()
                    .first()
                    .and_then(|t| t.failure_reason())
                    .map(|r| self.engine.shared.recovery.classify_message(r))
                    .unwrap_or(ErrorKind::Unknown);
                let message = format!("{} step(s) failed", failed.len());
                tracing::warn!(task_id = %task_id, failed = failed.len(), "task failed");
                let mut data = anomaly_payload(kind, &message, &self.task);
                data["failed_todos"] = json!(failed);
                data["suggestions"] = json!(suggestions_for(kind));
                self.emit(event(EventType::TaskFailed, &task_id, data)).await;
            }
            _ => {
                let pending: Vec<String> = self.task.pending_todos().iter().map(|t| t.id.clone()).collect();
                let unresolved: Vec<String> = pending
                    .iter()
                    .filter(|id| self.unresolved.contains(*id))
                    .cloned()
                    .collect();
                let (kind, message) = if unresolved.is_empty() {
                    tracing::warn!(task_id = %task_id, pending = pending.len(), "dependency graph stalled");
                    (
                        ErrorKind::System,
                        format!("Dependency graph stalled: {} pending step(s) are not ready", pending.len()),
                    )
                } else {
                    (
                        ErrorKind::Tool,
                        format!("{} step(s) have no available tool", unresolved.len()),
                    )
                };
                let mut data = anomaly_payload(kind, &message, &self.task);
                data["stalled"] = json!(unresolved.is_empty());
                data["status"] = json!(self.task.status);
                data["pending_todos"] = json!(pending);
                data["unresolved_todos"] = json!(unresolved);
                data["suggestions"] = json!(suggestions_for(kind));
                self.emit(event(EventType::TaskFailed, &task_id, data)).await;
            }
        }
    }

    async fn abort(&mut self, reason: &str) {
        tracing::info!(task_id = %self.task.id, reason = %reason, "task aborted");
        self.task.cancel();
        self.persist().await;
        let data = json!({
            "reason": reason,
            "progress": self.task.progress_percentage(),
            "duration": self.task.duration_secs(),
        });
        self.emit(event(EventType::TaskAborted, &self.task.id, data)).await;
    }

    async fn pause(&mut self, reason: &str) {
        tracing::info!(task_id = %self.task.id, reason = %reason, "task paused");
        self.task.metadata.insert("paused_at".into(), json!(Utc::now()));
        self.persist().await;
        let data = json!({
            "reason": reason,
            "progress": self.task.progress_percentage(),
            "remaining_todos": self.task.pending_todos().len() + self.task.in_progress_todos().len(),
        });
        self.emit(event(EventType::TaskPaused, &self.task.id, data)).await;
    }

    /// 任务级异常：经恢复引擎分类一次，然后以 task_failed 结束
    async fn fail(&mut self, err: EngineError) {
        tracing::error!(task_id = %self.task.id, error = %err, "task failed with unexpected error");
        let rctx = RecoveryContext::new(self.task.id.clone());
        let recovery = self.engine.shared.recovery.handle(&err, &rctx).await;
        self.task.mark_failed(&err.to_string());
        self.persist().await;
        let mut data = failure_payload(&err, &recovery);
        data["progress"] = json!(self.task.progress_percentage());
        data["duration"] = json!(self.task.duration_secs());
        self.emit(event(EventType::TaskFailed, &self.task.id, data)).await;
    }

    async fn warn(&mut self, message: &str) {
        tracing::warn!(task_id = %self.task.id, message = %message, "task warning");
        self.emit(event(EventType::Warning, &self.task.id, json!({ "message": message })))
            .await;
    }

    /// 强制同步写入
    async fn persist(&mut self) {
        self.task.touch();
        if let Err(e) = self.engine.shared.state.save(&self.task, true).await {
            tracing::error!(task_id = %self.task.id, error = %e, "failed to persist task");
        }
    }

    async fn mark_dirty(&mut self) {
        self.task.touch();
        self.engine.shared.state.put(self.task.clone()).await;
    }

    /// 标脏后推送
    async fn publish(&mut self, result: TaskResult) {
        self.mark_dirty().await;
        self.emit(result).await;
    }

    /// 调用方丢弃事件流后任务继续运行，只是不再推送
    async fn emit(&mut self, result: TaskResult) {
        if self.receiver_gone {
            return;
        }
        if self.tx.send(result).await.is_err() {
            self.receiver_gone = true;
            tracing::debug!(task_id = %self.task.id, "event stream dropped by caller");
        }
    }
}
