//! 工具编排器：把一个 TodoItem 变成零到多次工具调用
//!
//! 1. 能力：TodoItem 已列出则直接使用，否则按关键字推断，推不出时用 general_processor
//! 2. 解析：在 Ready 工具里先精确匹配名字，再匹配能力标签，最后做名字或描述的子串匹配，并校验权限
//! 3. 参数：按能力类别从内容中提取
//! 4. 分批：并发不安全的调用各占一个 Sequential 批次，安全调用按 max_parallel_tools 分组为 Parallel 批次
//! 5. 执行：按批次依赖顺序执行；Parallel 批次内并发，每个调用各自获取全局许可
//!
//! 过程中的事件经无界通道推送给调用方，最终汇总为 TodoOutcome。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::ConcurrencySection;
use crate::model::{
    ExecutionContext, ExecutionPlan, ExecutionStrategy, TodoItem, ToolCall, ToolExecutionBatch,
    ToolResult,
};
use crate::tools::executor::FAILURE_KEY;
use crate::tools::{Tool, ToolExecutor};

/// 推断不出能力时使用的兜底能力
pub const GENERAL_CAPABILITY: &str = "general_processor";

/// 编排过程事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    PlanCreated {
        plan_id: String,
        todo_id: String,
        batches: usize,
        total_calls: usize,
        estimated_duration_secs: f64,
    },
    BatchStarted {
        batch_id: String,
        strategy: ExecutionStrategy,
        calls: usize,
    },
    #[serde(rename = "tool_result")]
    ToolFinished(ToolResult),
    BatchCompleted {
        batch_id: String,
        succeeded: usize,
        failed: usize,
        elapsed_ms: u64,
    },
    Warning {
        todo_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
    },
}

/// 一个 TodoItem 的执行汇总
#[derive(Debug, Clone, Default)]
pub struct TodoOutcome {
    pub plan: Option<ExecutionPlan>,
    pub results: Vec<ToolResult>,
    /// 没有任何 Ready 工具能满足的能力
    pub unresolved: Vec<String>,
    /// 因 stop_batch_on_failure 提前结束
    pub stopped_early: bool,
}

impl TodoOutcome {
    pub fn failures(&self) -> Vec<&ToolResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }

    /// 一个工具都没解析到，未发生调用
    pub fn is_unresolved(&self) -> bool {
        self.results.is_empty() && !self.unresolved.is_empty()
    }

    /// 有调用且全部成功
    pub fn succeeded(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.success)
    }

    /// 是否有调用被熔断器直接拒绝
    pub fn breaker_rejected(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.metadata.get(FAILURE_KEY).and_then(Value::as_str) == Some("rejected"))
    }
}

pub struct ToolOrchestrator {
    executor: Arc<ToolExecutor>,
    max_parallel: usize,
    stop_batch_on_failure: bool,
}

impl ToolOrchestrator {
    pub fn new(executor: Arc<ToolExecutor>, cfg: &ConcurrencySection) -> Self {
        Self {
            executor,
            max_parallel: cfg.max_parallel_tools.max(1),
            stop_batch_on_failure: cfg.stop_batch_on_failure,
        }
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// 执行一个 TodoItem；不会向上报错，失败都体现在 TodoOutcome 与事件里
    pub async fn execute_todo(
        &self,
        todo: &TodoItem,
        ctx: Arc<ExecutionContext>,
        events: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> TodoOutcome {
        let capabilities = if todo.tools_needed.is_empty() {
            infer_capabilities(&todo.content)
        } else {
            todo.tools_needed.clone()
        };

        let (resolved, unresolved) = self.resolve_tools(&capabilities, &ctx).await;
        for (capability, reason) in &unresolved {
            tracing::warn!(todo_id = %todo.id, capability = %capability, reason = %reason, "capability unresolved");
            let _ = events.send(OrchestratorEvent::Warning {
                todo_id: todo.id.clone(),
                message: format!("No ready tool for capability '{}': {}", capability, reason),
                capability: Some(capability.clone()),
            });
        }
        let unresolved: Vec<String> = unresolved.into_iter().map(|(c, _)| c).collect();

        if resolved.is_empty() {
            return TodoOutcome {
                unresolved,
                ..TodoOutcome::default()
            };
        }

        let planned: Vec<PlannedCall> = resolved
            .into_iter()
            .map(|(capability, tool)| {
                let params = derive_parameters(&capability, tool.definition().name.as_str(), todo, &ctx);
                PlannedCall {
                    concurrency_safe: tool.is_concurrency_safe(&params),
                    estimate: tool.estimate_execution_time(&params),
                    call: ToolCall::new(tool.name(), params),
                }
            })
            .collect();
        let batches = plan_batches(planned, self.max_parallel);
        let plan = ExecutionPlan::new(&ctx.task_id, Some(&todo.id), batches);
        tracing::debug!(
            todo_id = %todo.id,
            plan_id = %plan.id,
            batches = plan.batches.len(),
            calls = plan.total_calls(),
            "execution plan created"
        );
        let _ = events.send(OrchestratorEvent::PlanCreated {
            plan_id: plan.id.clone(),
            todo_id: todo.id.clone(),
            batches: plan.batches.len(),
            total_calls: plan.total_calls(),
            estimated_duration_secs: plan.total_estimated_duration_secs,
        });

        let (results, stopped_early) = self.execute_plan(&plan, &todo.id, &ctx, events).await;
        TodoOutcome {
            plan: Some(plan),
            results,
            unresolved,
            stopped_early,
        }
    }

    /// 为每个能力挑选一个 Ready 工具；同一工具只调用一次
    pub async fn resolve_tools(
        &self,
        capabilities: &[String],
        ctx: &ExecutionContext,
    ) -> (Vec<(String, Arc<dyn Tool>)>, Vec<(String, String)>) {
        let ready = self.executor.registry().ready_tools().await;
        let mut resolved: Vec<(String, Arc<dyn Tool>)> = Vec::new();
        let mut unresolved = Vec::new();
        let mut seen = HashSet::new();

        for capability in capabilities {
            match find_tool(capability, &ready, ctx) {
                Ok(tool) => {
                    if seen.insert(tool.name().to_string()) {
                        resolved.push((capability.clone(), tool));
                    }
                }
                Err(reason) => unresolved.push((capability.clone(), reason)),
            }
        }
        (resolved, unresolved)
    }

    /// 按批次依赖推进；依赖永远满足不了的批次跳过并告警
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        todo_id: &str,
        ctx: &Arc<ExecutionContext>,
        events: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> (Vec<ToolResult>, bool) {
        let mut completed: HashSet<String> = HashSet::new();
        let mut results = Vec::new();

        loop {
            let ready: Vec<&ToolExecutionBatch> = plan.ready_batches(&completed);
            let Some(batch) = ready.first().copied() else {
                break;
            };

            let _ = events.send(OrchestratorEvent::BatchStarted {
                batch_id: batch.id.clone(),
                strategy: batch.strategy,
                calls: batch.calls.len(),
            });
            let started = std::time::Instant::now();
            let (batch_results, stopped) = match batch.strategy {
                ExecutionStrategy::Parallel => self.run_parallel(batch, ctx, events).await,
                ExecutionStrategy::Sequential => self.run_sequential(batch, ctx, events).await,
            };
            let failed = batch_results.iter().filter(|r| !r.success).count();
            let _ = events.send(OrchestratorEvent::BatchCompleted {
                batch_id: batch.id.clone(),
                succeeded: batch_results.len() - failed,
                failed,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            completed.insert(batch.id.clone());
            results.extend(batch_results);

            if stopped || (self.stop_batch_on_failure && failed > 0) {
                tracing::warn!(todo_id = %todo_id, batch_id = %batch.id, "stopping plan after failed batch");
                return (results, true);
            }
        }

        let blocked = plan.batches.len() - completed.len();
        if blocked > 0 {
            let _ = events.send(OrchestratorEvent::Warning {
                todo_id: todo_id.to_string(),
                message: format!("{} batch(es) skipped: unsatisfiable batch dependencies", blocked),
                capability: None,
            });
        }
        (results, false)
    }

    async fn run_parallel(
        &self,
        batch: &ToolExecutionBatch,
        ctx: &Arc<ExecutionContext>,
        events: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> (Vec<ToolResult>, bool) {
        let mut running: FuturesUnordered<_> = batch
            .calls
            .iter()
            .map(|call| self.executor.execute(call, ctx))
            .collect();
        let mut results = Vec::with_capacity(batch.calls.len());
        while let Some(result) = running.next().await {
            let _ = events.send(OrchestratorEvent::ToolFinished(result.clone()));
            results.push(result);
        }
        (results, false)
    }

    async fn run_sequential(
        &self,
        batch: &ToolExecutionBatch,
        ctx: &Arc<ExecutionContext>,
        events: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> (Vec<ToolResult>, bool) {
        let mut results = Vec::with_capacity(batch.calls.len());
        for call in &batch.calls {
            let result = self.executor.execute(call, ctx).await;
            let failed = !result.success;
            let _ = events.send(OrchestratorEvent::ToolFinished(result.clone()));
            results.push(result);
            if failed && self.stop_batch_on_failure {
                return (results, true);
            }
        }
        (results, false)
    }
}

struct PlannedCall {
    call: ToolCall,
    concurrency_safe: bool,
    estimate: Duration,
}

/// 不安全的调用各自成批（Sequential），安全调用按上限分组（Parallel）
fn plan_batches(calls: Vec<PlannedCall>, max_parallel: usize) -> Vec<ToolExecutionBatch> {
    let mut batches = Vec::new();
    let mut safe: Vec<PlannedCall> = Vec::new();
    for planned in calls {
        if planned.concurrency_safe {
            safe.push(planned);
        } else {
            batches.push(ToolExecutionBatch::new(
                vec![planned.call],
                ExecutionStrategy::Sequential,
                planned.estimate.as_secs_f64(),
            ));
        }
    }

    let mut safe = safe.into_iter().peekable();
    while safe.peek().is_some() {
        let chunk: Vec<PlannedCall> = safe.by_ref().take(max_parallel).collect();
        // 并发执行取平均耗时
        let estimate =
            chunk.iter().map(|p| p.estimate.as_secs_f64()).sum::<f64>() / chunk.len() as f64;
        batches.push(ToolExecutionBatch::new(
            chunk.into_iter().map(|p| p.call).collect(),
            ExecutionStrategy::Parallel,
            estimate,
        ));
    }
    batches
}

/// 按关键字推断能力
pub fn infer_capabilities(content: &str) -> Vec<String> {
    const RULES: &[(&[&str], &str)] = &[
        (&["read", "view", "读取", "查看"], "file_read"),
        (&["write", "save", "写入", "保存"], "file_write"),
        (&["search", "fetch", "搜索", "获取"], "web_search"),
        (&["process", "analyze", "analyse", "处理", "分析"], "data_processor"),
        (&["execute", "run", "执行", "运行"], "system_command"),
    ];
    let lower = content.to_lowercase();
    let words: HashSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();

    let mut caps: Vec<String> = RULES
        .iter()
        .filter(|(keywords, _)| {
            keywords.iter().any(|k| {
                if k.is_ascii() {
                    words.contains(k) || words.iter().any(|w| w.starts_with(k) && w.len() <= k.len() + 4)
                } else {
                    lower.contains(k)
                }
            })
        })
        .map(|(_, cap)| cap.to_string())
        .collect();
    if caps.is_empty() {
        caps.push(GENERAL_CAPABILITY.to_string());
    }
    caps
}

fn find_tool(
    capability: &str,
    ready: &[Arc<dyn Tool>],
    ctx: &ExecutionContext,
) -> Result<Arc<dyn Tool>, String> {
    let needle = capability.to_lowercase();
    let matchers: [&dyn Fn(&Arc<dyn Tool>) -> bool; 3] = [
        &|t: &Arc<dyn Tool>| t.definition().name == capability,
        &|t: &Arc<dyn Tool>| t.definition().has_capability(capability),
        &|t: &Arc<dyn Tool>| {
            let def = t.definition();
            def.name.to_lowercase().contains(&needle)
                || def.description.to_lowercase().contains(&needle)
        },
    ];

    let mut denied = None;
    for matcher in matchers {
        for tool in ready.iter().filter(|t| matcher(t)) {
            if ctx.grants(&tool.definition().required_permissions) {
                return Ok(tool.clone());
            }
            denied.get_or_insert_with(|| tool.name().to_string());
        }
    }
    Err(match denied {
        Some(tool) => format!("tool '{}' lacks required permissions", tool),
        None => "no matching ready tool".to_string(),
    })
}

fn read_path_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r#"(?i)\b(?:read|view|open|analy[sz]e)\s+(?:the\s+)?(?:file\s+)?["'`]?([^\s"'`,;]+)"#)
                .expect("valid read-path regex"),
            Regex::new(r#"([\w./\\-]+\.[A-Za-z0-9]{1,8})\b"#).expect("valid file-token regex"),
        ]
    })
}

/// 从内容中提取文件路径：先找动词后的参数，再找任何带扩展名的词
pub fn extract_file_path(content: &str) -> Option<String> {
    let [verb, token] = read_path_patterns();
    if let Some(path) = verb
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches(['.', ')']))
        .filter(|p| p.contains('.') || p.contains('/'))
    {
        return Some(path.to_string());
    }
    token
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
}

/// 按能力类别生成调用参数
pub fn derive_parameters(
    capability: &str,
    tool_name: &str,
    todo: &TodoItem,
    ctx: &ExecutionContext,
) -> Value {
    let mut params = json!({
        "content": todo.content,
        "todo_id": todo.id,
        "working_directory": ctx.working_directory.to_string_lossy(),
    });
    let kind = format!("{} {}", capability, tool_name).to_lowercase();
    if kind.contains("read") {
        if let Some(path) = extract_file_path(&todo.content) {
            params["file_path"] = json!(path);
        }
    } else if kind.contains("write") {
        params["file_path"] = json!(format!("output_{}.txt", todo.id));
    } else if kind.contains("search") {
        params["query"] = json!(todo.content);
        params["max_results"] = json!(10);
    }
    params
}
