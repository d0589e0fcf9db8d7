//! 集成测试共用的工具、判定器与引擎装配

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use taskforge::config::AppConfig;
use taskforge::engine::TaskResultStream;
use taskforge::model::{Complexity, ExecutionContext, Task, TaskResult, TodoDraft};
use taskforge::oracle::ComplexityOracle;
use taskforge::state::{FileStateStore, SqliteStateStore, StateStore};
use taskforge::tools::{Tool, ToolDefinition};
use taskforge::TaskEngine;

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    File,
    Sqlite,
}

pub const BACKENDS: [Backend; 2] = [Backend::File, Backend::Sqlite];

pub async fn open_store(backend: Backend, dir: &Path) -> Arc<dyn StateStore> {
    match backend {
        Backend::File => Arc::new(FileStateStore::new(dir.join("state")).await.unwrap()),
        Backend::Sqlite => Arc::new(SqliteStateStore::open(dir.join("state.db")).unwrap()),
    }
}

/// 退避极短、状态目录指向临时目录的配置
pub fn test_config(dir: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.workspace_root = Some(dir.join("workspace"));
    cfg.state.dir = dir.join("state");
    cfg.state.db_path = dir.join("state.db");
    cfg.recovery.base_delay_ms = 1;
    cfg.recovery.max_delay_ms = 5;
    cfg.concurrency.tool_timeout_secs = 5;
    cfg.interaction.user_response_timeout_secs = 5;
    cfg
}

/// 读到终止事件为止
pub async fn collect(mut events: TaskResultStream) -> Vec<TaskResult> {
    let mut out = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(10), events.next())
            .await
            .expect("event stream stalled");
        let Some(ev) = next else { break };
        let terminal = ev.is_terminal();
        out.push(ev);
        if terminal {
            break;
        }
    }
    out
}

/// 读到指定类型的事件为止
pub async fn wait_for(events: &mut TaskResultStream, kind: &str) -> TaskResult {
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(10), events.next())
            .await
            .expect("event stream stalled")
            .expect("stream ended early");
        if ev.kind == kind {
            return ev;
        }
    }
}

/// 等待所有任务退出 active 表
pub async fn wait_until_idle(engine: &TaskEngine) {
    for _ in 0..200 {
        if engine.active_tasks().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task did not finish");
}

pub fn kinds(events: &[TaskResult]) -> Vec<&str> {
    events.iter().map(|e| e.kind.as_str()).collect()
}

pub fn last(events: &[TaskResult]) -> &TaskResult {
    events.last().expect("no events")
}

/// 总是要求分解、返回固定步骤的判定器
pub struct FixedPlan {
    pub steps: Vec<TodoDraft>,
}

impl FixedPlan {
    pub fn new(steps: Vec<TodoDraft>) -> Arc<Self> {
        Arc::new(Self { steps })
    }
}

#[async_trait]
impl ComplexityOracle for FixedPlan {
    async fn classify(&self, _query: &str, _ctx: &ExecutionContext) -> Complexity {
        Complexity {
            score: 7,
            needs_decomposition: true,
            estimated_steps: self.steps.len().max(1) as u32,
            required_capabilities: Vec::new(),
            reasoning: "fixed plan".to_string(),
        }
    }

    async fn decompose(&self, _task: &Task, _capabilities: &[String], _ctx: &ExecutionContext) -> Vec<TodoDraft> {
        self.steps.clone()
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// 记录每次调用的步骤内容；可设置耗时与前若干次失败
pub struct Recorder {
    def: ToolDefinition,
    pub log: Arc<Mutex<Vec<String>>>,
    calls: AtomicUsize,
    delay: Duration,
    fail_first: usize,
    error: String,
}

impl Recorder {
    pub fn new(name: &str) -> Self {
        Self {
            def: ToolDefinition::new(name, "records step content").capabilities([name]),
            log: Arc::new(Mutex::new(Vec::new())),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_first: 0,
            error: String::new(),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 前 n 次调用返回 error
    pub fn failing(mut self, n: usize, error: &str) -> Self {
        self.fail_first = n;
        self.error = error.to_string();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for Recorder {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n < self.fail_first {
            return Err(self.error.clone());
        }
        let content = params["content"].as_str().unwrap_or_default().to_string();
        self.log.lock().unwrap().push(content.clone());
        Ok(json!({ "recorded": content }))
    }
}

/// 统计同时在执行的调用数
pub struct Overlap {
    def: ToolDefinition,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    /// 执行期间观察到的最大并发数（含自身）
    pub seen: AtomicUsize,
}

impl Overlap {
    pub fn new(name: &str, safe: bool, in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
        Self {
            def: ToolDefinition::new(name, "overlap probe")
                .capabilities([name])
                .concurrency_safe(safe),
            in_flight,
            peak,
            seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Tool for Overlap {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, _params: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        self.seen
            .fetch_max(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }
}
