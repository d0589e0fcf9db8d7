//! 任务引擎集成测试：执行顺序、并发安全、失败处理、中断与取消

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use taskforge::config::FailedTodoPolicy;
use taskforge::model::{ExecutionContext, TaskStatus, TodoDraft};
use taskforge::oracle::{OracleAdapter, ScriptedOracleClient};
use taskforge::tools::{Tool, ToolDefinition, ToolState};
use taskforge::TaskEngine;

use common::*;

#[tokio::test]
async fn test_simple_query_completes_with_duration() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = TaskEngine::builder(test_config(dir.path())).build().await.unwrap();

    let events = collect(engine.execute_task("get the current time", None).await).await;
    let kinds = kinds(&events);
    assert_eq!(kinds[0], "task_analysis_started");
    assert!(kinds.contains(&"complexity_analysis_completed"));
    assert!(!kinds.contains(&"task_decomposition_started"));
    assert!(kinds.contains(&"todo_list_generated"));
    assert!(kinds.contains(&"tool_execution_result"));
    assert!(kinds.contains(&"todo_completed"));

    let done = last(&events);
    assert_eq!(done.kind, "task_completed");
    assert!(done.data["duration"].as_f64().unwrap() >= 0.0);
    assert_eq!(done.data["progress"].as_f64(), Some(100.0));

    let generated = events.iter().find(|e| e.kind == "todo_list_generated").unwrap();
    assert_eq!(generated.data["count"], 1);
    assert_eq!(generated.data["synthetic"], true);

    let result = events.iter().find(|e| e.kind == "tool_execution_result").unwrap();
    assert_eq!(result.data["tool_name"], "general_processor");
    assert!(result.data["data"]["current_time"].is_string());

    let task_id = done.task_id.clone().unwrap();
    let status = engine.task_status(&task_id).await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    assert!(!status.active);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::new("recorder"));
    // 优先级与依赖方向相反，依赖必须优先
    let oracle = FixedPlan::new(vec![
        TodoDraft::new("step 1").tools(&["recorder"]).priority(1),
        TodoDraft::new("step 2").tools(&["recorder"]).depends_on(&[0]).priority(5),
        TodoDraft::new("step 3").tools(&["recorder"]).depends_on(&[1]).priority(9),
    ]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .with_tool(recorder.clone())
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("three dependent steps", None).await).await;
    assert_eq!(last(&events).kind, "task_completed");
    assert_eq!(recorder.entries(), vec!["step 1", "step 2", "step 3"]);

    let started: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == "todo_started")
        .map(|e| e.data["content"].as_str().unwrap())
        .collect();
    assert_eq!(started, vec!["step 1", "step 2", "step 3"]);

    // 进度单调不减
    let progress: Vec<f64> = events
        .iter()
        .filter(|e| e.kind == "todo_completed")
        .map(|e| e.data["progress"].as_f64().unwrap())
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last().copied(), Some(100.0));
}

#[tokio::test]
async fn test_unsafe_tool_runs_alone() {
    let dir = tempfile::TempDir::new().unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let safe_a = Arc::new(Overlap::new("safe_a", true, in_flight.clone(), peak.clone()));
    let safe_b = Arc::new(Overlap::new("safe_b", true, in_flight.clone(), peak.clone()));
    let exclusive = Arc::new(Overlap::new("exclusive", false, in_flight.clone(), peak.clone()));

    let oracle = FixedPlan::new(vec![
        TodoDraft::new("mixed step").tools(&["safe_a", "exclusive", "safe_b"]),
    ]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .with_tool(safe_a.clone())
        .with_tool(safe_b.clone())
        .with_tool(exclusive.clone())
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("mixed safety", None).await).await;
    assert_eq!(last(&events).kind, "task_completed");
    assert_eq!(
        events.iter().filter(|e| e.kind == "tool_execution_result").count(),
        3
    );
    assert_eq!(exclusive.seen.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_step_with_continue_policy_fails_task() {
    let dir = tempfile::TempDir::new().unwrap();
    let broken = Arc::new(Recorder::new("broken").failing(usize::MAX, "invalid input format"));
    let fine = Arc::new(Recorder::new("fine"));
    let oracle = FixedPlan::new(vec![
        TodoDraft::new("bad step").tools(&["broken"]),
        TodoDraft::new("independent step").tools(&["fine"]),
    ]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .with_tool(broken.clone())
        .with_tool(fine.clone())
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("one bad step", None).await).await;
    let failed = events.iter().find(|e| e.kind == "todo_failed").unwrap();
    assert_eq!(failed.data["error_kind"], "validation");
    assert_eq!(failed.data["recovery"]["action"], "abort");

    // Continue 策略下其余步骤照常执行
    assert_eq!(fine.entries(), vec!["independent step"]);
    assert_eq!(broken.calls(), 1);

    let done = last(&events);
    assert_eq!(done.kind, "task_failed");
    assert_eq!(done.data["failed_todos"].as_array().unwrap().len(), 1);
    assert_eq!(done.data["error_kind"], "validation");
    assert!(!done.data["suggestions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_on_first_failure_halts() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.task.failed_todo_policy = FailedTodoPolicy::StopOnFirstFailure;
    let broken = Arc::new(Recorder::new("broken").failing(usize::MAX, "invalid input"));
    let fine = Arc::new(Recorder::new("fine"));
    let oracle = FixedPlan::new(vec![
        TodoDraft::new("bad step").tools(&["broken"]).priority(10),
        TodoDraft::new("never runs").tools(&["fine"]),
    ]);
    let engine = TaskEngine::builder(cfg)
        .with_oracle(oracle)
        .with_tool(broken)
        .with_tool(fine.clone())
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("halt early", None).await).await;
    assert_eq!(last(&events).kind, "task_failed");
    assert!(fine.entries().is_empty());
}

#[tokio::test]
async fn test_requeue_retries_transient_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.task.failed_todo_policy = FailedTodoPolicy::Requeue;
    let flaky = Arc::new(Recorder::new("flaky").failing(1, "connection reset by peer"));
    let oracle = FixedPlan::new(vec![TodoDraft::new("fetch data").tools(&["flaky"])]);
    let engine = TaskEngine::builder(cfg)
        .with_oracle(oracle)
        .with_tool(flaky.clone())
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("flaky fetch", None).await).await;
    let kinds = kinds(&events);
    let failed_at = kinds.iter().position(|k| *k == "todo_failed").unwrap();
    let completed_at = kinds.iter().position(|k| *k == "todo_completed").unwrap();
    assert!(failed_at < completed_at);
    assert_eq!(events[failed_at].data["error_kind"], "network");
    assert_eq!(events[failed_at].data["recovery"]["action"], "retry");

    let restarted = events
        .iter()
        .filter(|e| e.kind == "todo_started")
        .map(|e| e.data["attempt"].as_u64().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(restarted, vec![1, 2]);
    assert_eq!(last(&events).kind, "task_completed");
    assert_eq!(flaky.calls(), 2);
}

#[tokio::test]
async fn test_open_breaker_stops_requeue() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.task.failed_todo_policy = FailedTodoPolicy::Requeue;
    cfg.task.max_retry_attempts = 10;
    cfg.recovery.breaker_threshold = 2;
    let broken = Arc::new(Recorder::new("broken").failing(usize::MAX, "boom"));
    let oracle = FixedPlan::new(vec![TodoDraft::new("keeps failing").tools(&["broken"])]);
    let engine = TaskEngine::builder(cfg)
        .with_oracle(oracle)
        .with_tool(broken.clone())
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("breaker", None).await).await;
    let failures: Vec<_> = events.iter().filter(|e| e.kind == "todo_failed").collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].data["recovery"]["action"], "retry");
    assert_eq!(failures[1].data["recovery"]["action"], "circuit_breaker_open");
    assert_eq!(broken.calls(), 2);
    assert_eq!(last(&events).kind, "task_failed");
}

#[tokio::test]
async fn test_missing_tool_leaves_step_pending() {
    let dir = tempfile::TempDir::new().unwrap();
    let oracle = FixedPlan::new(vec![TodoDraft::new("teleport").tools(&["quantum_teleport"])]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .without_builtin_tools()
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("impossible", None).await).await;
    assert!(events
        .iter()
        .any(|e| e.kind == "warning" && e.data["capability"] == "quantum_teleport"));
    assert!(!kinds(&events).contains(&"todo_failed"));

    let done = last(&events);
    assert_eq!(done.kind, "task_failed");
    assert_eq!(done.data["error_kind"], "tool");
    assert_eq!(done.data["stalled"], false);
    assert_eq!(done.data["unresolved_todos"].as_array().unwrap().len(), 1);

    // 步骤仍为 Pending，任务可在工具就绪后恢复
    let status = engine
        .task_status(done.task_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(status.status == TaskStatus::Pending || status.status == TaskStatus::InProgress);
    assert_eq!(status.pending_todos, 1);
}

#[tokio::test]
async fn test_scripted_oracle_drives_decomposition() {
    let dir = tempfile::TempDir::new().unwrap();
    let client = ScriptedOracleClient::new([
        r#"{"score": 6, "needs_decomposition": true, "estimated_steps": 2}"#,
        "```json\n{\"steps\": [{\"key\": \"a\", \"content\": \"collect\", \"tools_needed\": [\"recorder\"]}, {\"content\": \"summarize\", \"tools_needed\": [\"recorder\"], \"dependencies\": [\"a\"]}]}\n```",
    ]);
    let cfg = test_config(dir.path());
    let oracle = Arc::new(OracleAdapter::new(client, &cfg.task));
    let recorder = Arc::new(Recorder::new("recorder"));
    let engine = TaskEngine::builder(cfg)
        .with_oracle(oracle.clone())
        .with_tool(recorder.clone())
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("collect then summarize", None).await).await;
    assert!(kinds(&events).contains(&"task_decomposition_started"));
    assert_eq!(last(&events).kind, "task_completed");
    assert_eq!(recorder.entries(), vec!["collect", "summarize"]);
    assert_eq!(oracle.client().calls().await.len(), 2);
}

#[tokio::test]
async fn test_invalid_decomposition_fails_task() {
    let dir = tempfile::TempDir::new().unwrap();
    let oracle = FixedPlan::new(vec![
        TodoDraft::new("a").depends_on(&[1]),
        TodoDraft::new("b").depends_on(&[0]),
    ]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .build()
        .await
        .unwrap();

    let events = collect(engine.execute_task("cyclic plan", None).await).await;
    let done = last(&events);
    assert_eq!(done.kind, "task_failed");
    assert_eq!(done.data["error_kind"], "validation");
    assert!(done.data["error"].as_str().unwrap().to_lowercase().contains("cyclic"));
}

#[tokio::test]
async fn test_interruption_abort() {
    let dir = tempfile::TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::new("recorder").delay(Duration::from_millis(200)));
    let oracle = FixedPlan::new(vec![
        TodoDraft::new("first").tools(&["recorder"]),
        TodoDraft::new("second").tools(&["recorder"]).depends_on(&[0]),
    ]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .with_tool(recorder.clone())
        .build()
        .await
        .unwrap();

    let mut events = engine.execute_task("interrupt me", None).await;
    let started = wait_for(&mut events, "todo_started").await;
    let task_id = started.task_id.clone().unwrap();
    assert!(engine.request_interruption(&task_id).await);

    let request = wait_for(&mut events, "user_interaction_required").await;
    assert_eq!(request.data["data"]["next_todo"]["content"], "second");
    let event_id = request.data["id"].as_str().unwrap().to_string();
    assert!(engine.submit_user_response(&event_id, "abort", None).await);

    let rest = collect(events).await;
    assert_eq!(rest[0].kind, "user_interaction_response");
    assert_eq!(rest[0].data["action"], "abort");
    assert_eq!(last(&rest).kind, "task_aborted");
    assert_eq!(recorder.entries(), vec!["first"]);

    let status = engine.task_status(&task_id).await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_interruption_modify_with_plan_edit() {
    let dir = tempfile::TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::new("recorder").delay(Duration::from_millis(150)));
    let oracle = FixedPlan::new(vec![
        TodoDraft::new("first").tools(&["recorder"]),
        TodoDraft::new("second").tools(&["recorder"]).depends_on(&[0]),
    ]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .with_tool(recorder.clone())
        .build()
        .await
        .unwrap();

    let mut events = engine.execute_task("edit me", None).await;
    let started = wait_for(&mut events, "todo_started").await;
    let task_id = started.task_id.clone().unwrap();
    engine.request_interruption(&task_id).await;

    let request = wait_for(&mut events, "user_interaction_required").await;
    let second_id = request.data["data"]["next_todo"]["id"].as_str().unwrap().to_string();
    let edit = serde_json::json!({
        "plan_edit": {
            "modify_steps": [{ "id": second_id, "content": "second, revised" }],
        }
    });
    let data = edit.as_object().cloned();
    engine
        .submit_user_response(request.data["id"].as_str().unwrap(), "modify", data)
        .await;

    let rest = collect(events).await;
    let modified = rest.iter().find(|e| e.kind == "task_modified").unwrap();
    assert_eq!(modified.data["source"], "plan_edit");
    assert_eq!(last(&rest).kind, "task_completed");
    assert_eq!(recorder.entries(), vec!["first", "second, revised"]);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let dir = tempfile::TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::new("recorder").delay(Duration::from_millis(200)));
    let oracle = FixedPlan::new(vec![
        TodoDraft::new("first").tools(&["recorder"]),
        TodoDraft::new("second").tools(&["recorder"]).depends_on(&[0]),
    ]);
    let engine = TaskEngine::builder(test_config(dir.path()))
        .with_oracle(oracle)
        .with_tool(recorder.clone())
        .build()
        .await
        .unwrap();

    let mut events = engine.execute_task("cancel me", None).await;
    let started = wait_for(&mut events, "todo_started").await;
    let task_id = started.task_id.clone().unwrap();
    assert_eq!(engine.active_tasks().await.len(), 1);
    assert!(engine.cancel_task(&task_id).await);

    let rest = collect(events).await;
    let done = last(&rest);
    assert_eq!(done.kind, "task_aborted");
    assert_eq!(done.data["reason"], "Task cancelled");
    // 已开始的调用完成后结果被丢弃
    assert!(!kinds(&rest).contains(&"todo_completed"));

    let status = engine.task_status(&task_id).await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::Cancelled);
    assert!(!engine.cancel_task("no-such-task").await);
}

#[tokio::test]
async fn test_submitting_after_shutdown_fails_immediately() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = TaskEngine::builder(test_config(dir.path())).build().await.unwrap();
    engine.shutdown().await;

    let events = collect(engine.execute_task("too late", None).await).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "task_failed");
    assert!(engine.system_status().await.shutting_down);
}

#[tokio::test]
async fn test_finished_tasks_leave_the_state_cache() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = TaskEngine::builder(test_config(dir.path()))
        .build()
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        let events = collect(engine.execute_task(&format!("get the current time {i}"), None).await).await;
        let done = last(&events);
        assert_eq!(done.kind, "task_completed");
        ids.push(done.task_id.clone().unwrap());
    }
    wait_until_idle(&engine).await;

    let status = engine.system_status().await;
    assert_eq!(status.cached_tasks, 0);
    assert_eq!(status.dirty_tasks, 0);
    // 仍可从后端读取
    for id in &ids {
        let report = engine.task_status(id).await.unwrap().unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
    }
}

/// health_check 结果可在测试中切换
struct Switchable {
    def: ToolDefinition,
    healthy: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl Tool for Switchable {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, _params: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }

    async fn health_check(&self) -> Result<bool, String> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

async fn wait_for_state(engine: &TaskEngine, tool: &str, state: ToolState) {
    for _ in 0..500 {
        if engine.registry().state(tool).await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tool {tool} never reached {state:?}");
}

#[tokio::test]
async fn test_health_monitor_withdraws_unhealthy_tool() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.lifecycle.health_check_interval_secs = 1;
    let tool = Arc::new(Switchable {
        def: ToolDefinition::new("sensor", "reads a sensor").capabilities(["sensor"]),
        healthy: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
    });
    let oracle = FixedPlan::new(vec![TodoDraft::new("read sensor").tools(&["sensor"])]);
    let engine = TaskEngine::builder(cfg)
        .with_oracle(oracle)
        .without_builtin_tools()
        .with_tool(tool.clone())
        .build()
        .await
        .unwrap();
    assert!(engine.system_status().await.tools.monitoring);
    assert_eq!(engine.registry().state("sensor").await, ToolState::Ready);

    tool.healthy.store(false, Ordering::SeqCst);
    wait_for_state(&engine, "sensor", ToolState::Unavailable).await;

    let events = collect(engine.execute_task("read the sensor", None).await).await;
    let done = last(&events);
    assert_eq!(done.kind, "task_failed");
    assert_eq!(done.data["unresolved_todos"].as_array().unwrap().len(), 1);
    assert_eq!(tool.calls.load(Ordering::SeqCst), 0);

    // 恢复健康后重新可用，未完成的任务可以续跑
    tool.healthy.store(true, Ordering::SeqCst);
    wait_for_state(&engine, "sensor", ToolState::Ready).await;
    wait_until_idle(&engine).await;
    let resumed = collect(engine.resume_task(done.task_id.as_deref().unwrap()).await).await;
    assert_eq!(last(&resumed).kind, "task_completed");
    assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

    engine.shutdown().await;
    assert!(!engine.system_status().await.tools.monitoring);
}
