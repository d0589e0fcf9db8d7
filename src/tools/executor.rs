//! 工具执行器
//!
//! 一次调用的完整路径：查找工具 → 参数与权限校验 → 熔断器放行 → 获取全局并发许可 → 超时内消费 execute_stream。
//! 所有结果（包括拒绝与超时）都折叠为 ToolResult，不向上抛错；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::core::{BreakerDecision, CircuitBreakerRegistry, EngineError, TaskScheduler};
use crate::model::{ExecutionContext, ToolCall, ToolResult};
use crate::tools::{Tool, ToolLifecycleRegistry, ToolState};

/// ToolResult.metadata 中记录失败类别的键
pub const FAILURE_KEY: &str = "failure";

/// 工具执行器：对每次调用施加超时、并发许可与熔断
pub struct ToolExecutor {
    registry: Arc<ToolLifecycleRegistry>,
    scheduler: Arc<TaskScheduler>,
    breakers: Arc<CircuitBreakerRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolLifecycleRegistry>,
        scheduler: Arc<TaskScheduler>,
        breakers: Arc<CircuitBreakerRegistry>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            registry,
            scheduler,
            breakers,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolLifecycleRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// 执行一次调用；熔断拒绝时不会触达工具
    pub async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolResult {
        let start = Instant::now();
        let preview = args_preview(&call.parameters);

        let tool = match self.registry.get(&call.tool_name).await {
            Some(t) if self.registry.state(&call.tool_name).await == ToolState::Ready => t,
            Some(_) => {
                let msg = format!("Tool '{}' is not ready", call.tool_name);
                return self.finish(call, Err((msg, "not_found")), start, &preview);
            }
            None => {
                let msg = format!("Tool not found: {}", call.tool_name);
                return self.finish(call, Err((msg, "not_found")), start, &preview);
            }
        };

        if let Err(e) = tool.validate_parameters(&call.parameters) {
            let msg = format!("Invalid parameters for '{}': {}", call.tool_name, e);
            return self.finish(call, Err((msg, "validation")), start, &preview);
        }
        if !ctx.grants(&tool.definition().required_permissions) {
            let msg = format!(
                "Permission denied: '{}' requires {:?}",
                call.tool_name,
                tool.definition().required_permissions
            );
            return self.finish(call, Err((msg, "permission")), start, &preview);
        }

        if let BreakerDecision::Rejected { retry_after } = self.breakers.try_acquire(&call.tool_name).await {
            let msg = format!(
                "Circuit breaker open for tool '{}', retry after {}s",
                call.tool_name,
                retry_after.as_secs()
            );
            return self
                .finish(call, Err((msg, "rejected")), start, &preview)
                .with_metadata("retry_after_ms", json!(retry_after.as_millis() as u64));
        }

        let _permit = match self.scheduler.acquire_tool().await {
            Ok(p) => p,
            Err(e) => {
                // 许可池关闭：未真正调用工具，不计入熔断
                return self.finish(call, Err((e.to_string(), "shutdown")), start, &preview);
            }
        };

        let outcome = match timeout(self.timeout, collect_stream(tool.as_ref(), call, ctx)).await {
            Ok(Ok(data)) => {
                self.breakers.record_success(&call.tool_name).await;
                Ok(data)
            }
            Ok(Err(e)) => {
                self.breakers.record_failure(&call.tool_name).await;
                Err((e, "error"))
            }
            Err(_) => {
                self.breakers.record_failure(&call.tool_name).await;
                let msg = format!(
                    "Tool '{}' timed out after {}s",
                    call.tool_name,
                    self.timeout.as_secs()
                );
                Err((msg, "timeout"))
            }
        };
        self.finish(call, outcome, start, &preview)
    }

    fn finish(
        &self,
        call: &ToolCall,
        outcome: Result<Value, (String, &'static str)>,
        start: Instant,
        preview: &str,
    ) -> ToolResult {
        let duration_ms = start.elapsed().as_millis() as u64;
        let (ok, label) = match &outcome {
            Ok(_) => (true, "ok"),
            Err((_, "timeout")) => (false, "timeout"),
            Err((_, "rejected")) => (false, "rejected"),
            Err(_) => (false, "error"),
        };
        let audit = json!({
            "event": "tool_audit",
            "tool": call.tool_name,
            "ok": ok,
            "outcome": label,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match outcome {
            Ok(data) => ToolResult::ok(call, data, duration_ms),
            Err((msg, failure)) => {
                ToolResult::err(call, msg, duration_ms).with_metadata(FAILURE_KEY, json!(failure))
            }
        }
    }
}

/// 消费工具的结果流：单块直接返回，多块收集为数组，遇错即止
async fn collect_stream(
    tool: &dyn Tool,
    call: &ToolCall,
    ctx: &ExecutionContext,
) -> Result<Value, String> {
    let mut stream = tool.execute_stream(call.parameters.clone(), ctx);
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk?);
    }
    Ok(match chunks.len() {
        0 => Value::Null,
        1 => chunks.remove(0),
        _ => Value::Array(chunks),
    })
}

/// 把失败的 ToolResult 还原为可分类的 EngineError；成功返回 None
pub fn failure_error(result: &ToolResult) -> Option<EngineError> {
    if result.success {
        return None;
    }
    let message = result
        .error
        .clone()
        .unwrap_or_else(|| "unknown tool error".to_string());
    let tool = result.tool_name.clone();
    let failure = result.metadata.get(FAILURE_KEY).and_then(Value::as_str);
    Some(match failure {
        Some("timeout") => EngineError::ToolTimeout(tool),
        Some("rejected") => EngineError::CircuitOpen(tool),
        Some("permission") => EngineError::PermissionDenied(message),
        Some("validation") => EngineError::Validation(message),
        Some("not_found") => EngineError::ToolNotFound(tool),
        Some("shutdown") => EngineError::Shutdown,
        _ => EngineError::ToolExecutionFailed { tool, message },
    })
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleSection;
    use crate::core::BreakerState;
    use crate::tools::ToolDefinition;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        def: ToolDefinition,
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl Flaky {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                def: ToolDefinition::new(name, "test tool"),
                calls: AtomicUsize::new(0),
                fail,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Tool for Flaky {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }

        async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err("connection reset".into())
            } else {
                Ok(params)
            }
        }
    }

    struct Chunked {
        def: ToolDefinition,
    }

    #[async_trait]
    impl Tool for Chunked {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }

        async fn execute(&self, _params: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
            Ok(Value::Null)
        }

        fn execute_stream<'a>(
            &'a self,
            _params: Value,
            _ctx: &'a ExecutionContext,
        ) -> BoxStream<'a, Result<Value, String>> {
            Box::pin(stream::iter(vec![Ok(json!(1)), Ok(json!(2))]))
        }
    }

    async fn executor(tools: Vec<Arc<dyn Tool>>, threshold: u32) -> ToolExecutor {
        let registry = Arc::new(ToolLifecycleRegistry::new(&LifecycleSection::default()));
        for t in tools {
            registry.register(t, &[], false).await.unwrap();
        }
        ToolExecutor::new(
            registry,
            Arc::new(TaskScheduler::new(2)),
            Arc::new(CircuitBreakerRegistry::new(threshold, Duration::from_secs(60))),
            5,
        )
    }

    #[tokio::test]
    async fn test_success_and_stream_collection() {
        let exec = executor(
            vec![
                Flaky::new("ok", false),
                Arc::new(Chunked {
                    def: ToolDefinition::new("chunked", "two chunks"),
                }),
            ],
            5,
        )
        .await;
        let ctx = ExecutionContext::new("t1", ".");

        let result = exec.execute(&ToolCall::new("ok", json!({"a": 1})), &ctx).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"a": 1})));

        let result = exec.execute(&ToolCall::new("chunked", json!({})), &ctx).await;
        assert_eq!(result.data, Some(json!([1, 2])));
        assert_eq!(exec.scheduler().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_permission() {
        let tool = Arc::new(Flaky {
            def: ToolDefinition::new("writer", "needs write").permissions(["file_write"]),
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
        });
        let exec = executor(vec![tool.clone()], 5).await;
        let mut ctx = ExecutionContext::new("t1", ".");

        let missing = exec.execute(&ToolCall::new("nope", json!({})), &ctx).await;
        assert!(matches!(failure_error(&missing), Some(EngineError::ToolNotFound(_))));

        ctx.allow_file_write = false;
        let denied = exec.execute(&ToolCall::new("writer", json!({})), &ctx).await;
        assert!(matches!(failure_error(&denied), Some(EngineError::PermissionDenied(_))));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_rejects_without_invoking() {
        let tool = Flaky::new("net", true);
        let exec = executor(vec![tool.clone()], 2).await;
        let ctx = ExecutionContext::new("t1", ".");

        for _ in 0..2 {
            let r = exec.execute(&ToolCall::new("net", json!({})), &ctx).await;
            assert!(matches!(
                failure_error(&r),
                Some(EngineError::ToolExecutionFailed { .. })
            ));
        }
        let rejected = exec.execute(&ToolCall::new("net", json!({})), &ctx).await;
        assert!(!rejected.success);
        assert!(matches!(failure_error(&rejected), Some(EngineError::CircuitOpen(_))));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
        assert_eq!(exec.breakers.state("net").await, BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let tool = Arc::new(Flaky {
            def: ToolDefinition::new("slow", "sleeps"),
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::from_secs(30),
        });
        let exec = executor(vec![tool], 5).await;
        let ctx = ExecutionContext::new("t1", ".");
        let r = exec.execute(&ToolCall::new("slow", json!({})), &ctx).await;
        assert!(matches!(failure_error(&r), Some(EngineError::ToolTimeout(_))));
        assert_eq!(exec.scheduler().in_flight(), 0);
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({ "text": "x".repeat(500) });
        let preview = args_preview(&long);
        assert_eq!(preview.chars().count(), 203);
    }
}
