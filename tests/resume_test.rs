//! 断点续跑与持久化：文件与 SQLite 两种后端

mod common;

use std::sync::Arc;
use std::time::Duration;

use taskforge::model::{Task, TaskStatus, TodoDraft, TodoItem};
use taskforge::TaskEngine;

use common::*;

/// 三步链：前两步已完成，第三步待执行
fn partially_done_task() -> Task {
    let mut a = TodoItem::new("step 1").with_tools(["recorder"]);
    let mut b = TodoItem::new("step 2")
        .with_tools(["recorder"])
        .with_dependencies([a.id.clone()]);
    let c = TodoItem::new("step 3")
        .with_tools(["recorder"])
        .with_dependencies([b.id.clone()]);
    for todo in [&mut a, &mut b] {
        todo.mark_started().unwrap();
        todo.mark_completed().unwrap();
    }
    let mut task = Task::new("three step chain");
    task.replace_todo_list(vec![a, b, c]).unwrap();
    task.mark_started();
    task.update_status();
    task
}

#[tokio::test]
async fn test_resume_finishes_remaining_step() {
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let task = partially_done_task();
        assert_eq!(task.status, TaskStatus::InProgress);
        store.save(&task).await.unwrap();

        let recorder = Arc::new(Recorder::new("recorder"));
        let engine = TaskEngine::builder(test_config(dir.path()))
            .with_store(store.clone())
            .with_tool(recorder.clone())
            .build()
            .await
            .unwrap();

        let info = engine.recovery_info(&task.id).await.unwrap().unwrap();
        assert!(info.can_resume, "{:?}", backend);

        let events = collect(engine.resume_task(&task.id).await).await;
        assert_eq!(events[0].kind, "task_resumed");
        assert_eq!(events[0].data["remaining_todos"], 1);
        // 已有计划，不再重新分析
        assert!(!kinds(&events).contains(&"task_analysis_started"));

        let done = last(&events);
        assert_eq!(done.kind, "task_completed", "{:?}", backend);
        assert_eq!(done.data["progress"].as_f64(), Some(100.0));
        assert_eq!(recorder.entries(), vec!["step 3"]);

        let stored = store.load(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.progress_percentage(), 100.0);
    }
}

#[tokio::test]
async fn test_resume_resets_interrupted_step() {
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let mut task = partially_done_task();
        // 进程在第三步执行中退出
        let last_id = task.todo_list[2].id.clone();
        task.todo_mut(&last_id).unwrap().mark_started().unwrap();
        store.save(&task).await.unwrap();

        let recorder = Arc::new(Recorder::new("recorder"));
        let engine = TaskEngine::builder(test_config(dir.path()))
            .with_store(store.clone())
            .with_tool(recorder.clone())
            .build()
            .await
            .unwrap();

        let events = collect(engine.resume_task(&task.id).await).await;
        assert_eq!(events[0].data["reset_todos"], 1, "{:?}", backend);
        let started = events.iter().find(|e| e.kind == "todo_started").unwrap();
        assert_eq!(started.data["attempt"], 2);
        assert_eq!(last(&events).kind, "task_completed");
    }
}

#[tokio::test]
async fn test_resume_rejects_unknown_and_finished_tasks() {
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let mut finished = Task::new("done already");
        let mut todo = TodoItem::new("only step");
        todo.mark_started().unwrap();
        todo.mark_completed().unwrap();
        finished.replace_todo_list(vec![todo]).unwrap();
        finished.update_status();
        store.save(&finished).await.unwrap();

        let engine = TaskEngine::builder(test_config(dir.path()))
            .with_store(store)
            .build()
            .await
            .unwrap();

        let events = collect(engine.resume_task("missing-task").await).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "task_resume_failed", "{:?}", backend);
        assert_eq!(events[0].data["error_kind"], "validation");

        let events = collect(engine.resume_task(&finished.id).await).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "task_resume_failed");
        assert!(!events[0].data["suggestions"].as_array().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_pause_then_resume() {
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

    let mut events = engine.execute_task("pause me", None).await;
    let started = wait_for(&mut events, "todo_started").await;
    let task_id = started.task_id.clone().unwrap();
    engine.request_interruption(&task_id).await;
    let request = wait_for(&mut events, "user_interaction_required").await;
    engine
        .submit_user_response(request.data["id"].as_str().unwrap(), "pause", None)
        .await;

    let rest = collect(events).await;
    let paused = last(&rest);
    assert_eq!(paused.kind, "task_paused");
    assert_eq!(paused.data["progress"].as_f64(), Some(50.0));
    wait_until_idle(&engine).await;

    let status = engine.task_status(&task_id).await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::InProgress);

    let resumed = collect(engine.resume_task(&task_id).await).await;
    assert_eq!(last(&resumed).kind, "task_completed");
    assert_eq!(recorder.entries(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_shutdown_pauses_and_new_engine_resumes() {
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::new("recorder").delay(Duration::from_millis(150)));
        let steps = vec![
            TodoDraft::new("first").tools(&["recorder"]),
            TodoDraft::new("second").tools(&["recorder"]).depends_on(&[0]),
        ];
        let engine = TaskEngine::builder(test_config(dir.path()))
            .with_store(open_store(backend, dir.path()).await)
            .with_oracle(FixedPlan::new(steps.clone()))
            .with_tool(recorder.clone())
            .build()
            .await
            .unwrap();

        let mut events = engine.execute_task("survive a restart", None).await;
        let started = wait_for(&mut events, "todo_started").await;
        let task_id = started.task_id.clone().unwrap();

        let closing = engine.clone();
        let shutdown = tokio::spawn(async move { closing.shutdown().await });
        let rest = collect(events).await;
        shutdown.await.unwrap();
        assert_eq!(last(&rest).kind, "task_paused", "{:?}", backend);
        assert!(engine.active_tasks().await.is_empty());

        let recorder = Arc::new(Recorder::new("recorder"));
        let restarted = TaskEngine::builder(test_config(dir.path()))
            .with_store(open_store(backend, dir.path()).await)
            .with_oracle(FixedPlan::new(steps))
            .with_tool(recorder.clone())
            .build()
            .await
            .unwrap();
        let resumed = collect(restarted.resume_task(&task_id).await).await;
        assert_eq!(last(&resumed).kind, "task_completed", "{:?}", backend);
        assert_eq!(recorder.entries(), vec!["second"]);
    }
}

#[tokio::test]
async fn test_concurrent_resume_runs_task_once() {
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let task = partially_done_task();
        store.save(&task).await.unwrap();

        let recorder = Arc::new(Recorder::new("recorder").delay(Duration::from_millis(100)));
        let engine = TaskEngine::builder(test_config(dir.path()))
            .with_store(store.clone())
            .with_tool(recorder.clone())
            .build()
            .await
            .unwrap();

        let (a, b) = tokio::join!(engine.resume_task(&task.id), engine.resume_task(&task.id));
        let (a, b) = tokio::join!(collect(a), collect(b));
        let terminals = [last(&a).kind.as_str(), last(&b).kind.as_str()];
        assert!(terminals.contains(&"task_completed"), "{:?} {:?}", backend, terminals);
        assert!(terminals.contains(&"task_resume_failed"), "{:?} {:?}", backend, terminals);

        let rejected = if last(&a).kind == "task_resume_failed" { &a } else { &b };
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].data["error_kind"], "validation");

        assert_eq!(recorder.calls(), 1, "{:?}", backend);
        assert_eq!(recorder.entries(), vec!["step 3"]);
        wait_until_idle(&engine).await;
    }
}

#[tokio::test]
async fn test_resume_rejects_corrupt_plan() {
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;

        // 手工改坏的记录：a、b 互相依赖
        let mut a = TodoItem::new("a").with_tools(["recorder"]);
        let mut b = TodoItem::new("b").with_tools(["recorder"]);
        a.dependencies = vec![b.id.clone()];
        b.dependencies = vec![a.id.clone()];
        let mut cyclic = Task::new("cyclic record");
        cyclic.todo_list = vec![a, b];
        store.save(&cyclic).await.unwrap();

        let mut c = TodoItem::new("c").with_tools(["recorder"]);
        c.dependencies = vec!["missing-step".to_string()];
        let mut dangling = Task::new("dangling record");
        dangling.todo_list = vec![c];
        store.save(&dangling).await.unwrap();

        let recorder = Arc::new(Recorder::new("recorder"));
        let engine = TaskEngine::builder(test_config(dir.path()))
            .with_store(store.clone())
            .with_tool(recorder.clone())
            .build()
            .await
            .unwrap();

        for (id, needle) in [(&cyclic.id, "cyclic"), (&dangling.id, "missing-step")] {
            let events = collect(engine.resume_task(id).await).await;
            assert_eq!(kinds(&events), vec!["task_resume_failed"], "{:?}", backend);
            assert_eq!(events[0].data["error_kind"], "validation");
            let error = events[0].data["error"].as_str().unwrap().to_lowercase();
            assert!(error.contains(needle), "{:?}: {}", backend, error);
        }
        // 校验失败会释放占位，不会留下 "already running"
        assert!(engine.active_tasks().await.is_empty());
        let again = collect(engine.resume_task(&cyclic.id).await).await;
        assert!(!again[0].data["error"].as_str().unwrap().contains("already running"));
        assert_eq!(recorder.calls(), 0);
    }
}
