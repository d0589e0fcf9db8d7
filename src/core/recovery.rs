//! 错误恢复引擎
//!
//! 先按错误种类、再按关键字表把 EngineError 归为 ErrorKind，结合尝试次数选出 RecoveryStrategy，
//! 生成 RecoveryOutcome 供 TaskEngine 决定重排、跳过还是保持失败；熔断开启的工具直接返回 should_continue=false。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::{ErrorPatternConfig, RecoverySection};
use crate::core::circuit_breaker::{BreakerState, CircuitBreakerRegistry};
use crate::core::{EngineError, ErrorKind, RecoveryStrategy};

/// 错误模式：关键字命中后归入 kind，并给出默认策略与重试上限
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub kind: ErrorKind,
    pub keywords: Vec<String>,
    pub strategy: RecoveryStrategy,
    /// 允许的重试次数；第 max_retries + 1 次失败视为用尽
    pub max_retries: u32,
    pub backoff_factor: Option<f64>,
    pub fallback_action: Option<String>,
}

impl ErrorPattern {
    pub fn new(kind: ErrorKind, keywords: &[&str], strategy: RecoveryStrategy, max_retries: u32) -> Self {
        Self {
            kind,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            strategy,
            max_retries,
            backoff_factor: None,
            fallback_action: None,
        }
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = Some(factor);
        self
    }

    pub fn with_fallback(mut self, action: impl Into<String>) -> Self {
        self.fallback_action = Some(action.into());
        self
    }

    fn matches(&self, message: &str) -> bool {
        self.keywords.iter().any(|k| message.contains(k.as_str()))
    }
}

impl From<&ErrorPatternConfig> for ErrorPattern {
    fn from(cfg: &ErrorPatternConfig) -> Self {
        Self {
            kind: cfg.kind,
            keywords: cfg.keywords.iter().map(|k| k.to_lowercase()).collect(),
            strategy: cfg.strategy,
            max_retries: cfg.max_retries,
            backoff_factor: cfg.backoff_factor,
            fallback_action: cfg.fallback_action.clone(),
        }
    }
}

/// 默认错误模式表
pub fn default_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern::new(
            ErrorKind::Timeout,
            &["timeout", "timed out"],
            RecoveryStrategy::Retry,
            3,
        )
        .with_backoff_factor(2.0),
        ErrorPattern::new(
            ErrorKind::Network,
            &["connection", "network", "unreachable"],
            RecoveryStrategy::Retry,
            2,
        )
        .with_backoff_factor(1.5),
        ErrorPattern::new(
            ErrorKind::Permission,
            &["permission", "access denied", "forbidden"],
            RecoveryStrategy::Manual,
            1,
        ),
        ErrorPattern::new(
            ErrorKind::FileSystem,
            &["file not found", "no such file", "not a directory"],
            RecoveryStrategy::Fallback,
            1,
        )
        .with_fallback("create_default_file"),
        ErrorPattern::new(
            ErrorKind::Validation,
            &["validation", "invalid"],
            RecoveryStrategy::Abort,
            0,
        ),
    ]
}

/// 一次恢复调用的上下文
#[derive(Debug, Clone, Default)]
pub struct RecoveryContext {
    pub task_id: String,
    pub todo_id: Option<String>,
    pub tool_name: Option<String>,
    /// 从 1 开始的尝试序号
    pub attempt: u32,
}

impl RecoveryContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt: 1,
            ..Default::default()
        }
    }

    pub fn todo(mut self, todo_id: impl Into<String>) -> Self {
        self.todo_id = Some(todo_id.into());
        self
    }

    pub fn tool(mut self, tool_name: Option<String>) -> Self {
        self.tool_name = tool_name;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }
}

/// 恢复结果里的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Skip,
    Abort,
    ManualInterventionRequired,
    CircuitBreakerOpen,
}

/// 恢复结果（随 todo_failed / task_failed 事件下发）
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub action: RecoveryAction,
    pub strategy: Option<RecoveryStrategy>,
    pub error_kind: ErrorKind,
    pub success: bool,
    pub should_continue: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_action: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl RecoveryOutcome {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.unwrap_or(0))
    }
}

/// 历史记录项
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub todo_id: Option<String>,
    pub tool_name: Option<String>,
    pub error: String,
    pub error_kind: ErrorKind,
    pub attempt: u32,
    pub action: RecoveryAction,
    pub at: DateTime<Utc>,
}

/// 统计快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub total_errors: u64,
    pub recovered_errors: u64,
    pub failed_recoveries: u64,
    pub error_kinds: HashMap<ErrorKind, u64>,
    pub strategies: HashMap<RecoveryStrategy, u64>,
    pub success_rate: f64,
    pub open_circuit_breakers: usize,
}

/// 退避参数：delay = min(max, base × factor^(attempt-1))
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32, factor: Option<f64>) -> Duration {
        let factor = factor.unwrap_or(self.factor).max(1.0);
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * factor.powi(exp);
        let max = self.max.as_secs_f64();
        let secs = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 1.5,
            max: Duration::from_secs(30),
        }
    }
}

/// 按任务分组的恢复记录；任务数与每个任务的记录数都有上限
struct RecoveryHistory {
    max_tasks: usize,
    per_task: usize,
    order: VecDeque<String>,
    records: HashMap<String, Vec<RecoveryRecord>>,
}

impl RecoveryHistory {
    fn new(max_tasks: usize, per_task: usize) -> Self {
        Self {
            max_tasks: max_tasks.max(1),
            per_task: per_task.max(1),
            order: VecDeque::new(),
            records: HashMap::new(),
        }
    }

    fn push(&mut self, task_id: &str, record: RecoveryRecord) {
        if !self.records.contains_key(task_id) {
            self.order.push_back(task_id.to_string());
            while self.order.len() > self.max_tasks {
                if let Some(oldest) = self.order.pop_front() {
                    self.records.remove(&oldest);
                }
            }
        }
        let records = self.records.entry(task_id.to_string()).or_default();
        records.push(record);
        if records.len() > self.per_task {
            let excess = records.len() - self.per_task;
            records.drain(..excess);
        }
    }
}

/// 错误恢复引擎：分类、选策略、维护统计与熔断器
pub struct ErrorRecoveryEngine {
    patterns: Vec<ErrorPattern>,
    backoff: BackoffPolicy,
    default_max_retries: u32,
    breakers: Arc<CircuitBreakerRegistry>,
    stats: Mutex<RecoveryStats>,
    history: RwLock<RecoveryHistory>,
}

impl ErrorRecoveryEngine {
    pub fn new(cfg: &RecoverySection, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let patterns = if cfg.patterns.is_empty() {
            default_patterns()
        } else {
            cfg.patterns.iter().map(ErrorPattern::from).collect()
        };
        Self {
            patterns,
            backoff: BackoffPolicy {
                base: cfg.base_delay(),
                factor: cfg.backoff_factor,
                max: cfg.max_delay(),
            },
            default_max_retries: cfg.default_max_retries,
            breakers,
            stats: Mutex::new(RecoveryStats::default()),
            history: RwLock::new(RecoveryHistory::new(cfg.history_max_tasks, cfg.history_per_task)),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// 先看错误种类，再按关键字表匹配错误文本
    pub fn classify(&self, err: &EngineError) -> ErrorKind {
        if let Some(kind) = err.kind_hint() {
            return kind;
        }
        match self.classify_message(&err.to_string()) {
            ErrorKind::Unknown if matches!(err, EngineError::ToolExecutionFailed { .. }) => {
                ErrorKind::Tool
            }
            kind => kind,
        }
    }

    pub fn classify_message(&self, message: &str) -> ErrorKind {
        let lower = message.to_lowercase();
        self.patterns
            .iter()
            .find(|p| p.matches(&lower))
            .map(|p| p.kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    /// 按 kind 与尝试次数选择策略；次数用尽时有 fallback 则降级，否则终止
    pub fn select_strategy(&self, kind: ErrorKind, attempt: u32) -> (RecoveryStrategy, Option<&ErrorPattern>) {
        match self.patterns.iter().find(|p| p.kind == kind) {
            Some(p) if attempt > p.max_retries => {
                if p.fallback_action.is_some() {
                    (RecoveryStrategy::Fallback, Some(p))
                } else {
                    (RecoveryStrategy::Abort, Some(p))
                }
            }
            Some(p) => (p.strategy, Some(p)),
            None if attempt > self.default_max_retries => (RecoveryStrategy::Abort, None),
            None => (RecoveryStrategy::Retry, None),
        }
    }

    /// 处理一次错误，返回恢复结果并更新统计
    pub async fn handle(&self, err: &EngineError, ctx: &RecoveryContext) -> RecoveryOutcome {
        let kind = self.classify(err);
        let attempt = ctx.attempt.max(1);

        let breaker_open = match ctx.tool_name.as_deref().or_else(|| err.tool_name()) {
            Some(tool) => self.breakers.state(tool).await == BreakerState::Open,
            None => false,
        };

        let outcome = if breaker_open || matches!(err, EngineError::CircuitOpen(_)) {
            let tool = ctx
                .tool_name
                .clone()
                .or_else(|| err.tool_name().map(str::to_string))
                .unwrap_or_default();
            RecoveryOutcome {
                action: RecoveryAction::CircuitBreakerOpen,
                strategy: None,
                error_kind: kind,
                success: false,
                should_continue: false,
                message: format!("Circuit breaker open, not retrying tool '{tool}'"),
                delay_ms: None,
                next_attempt: None,
                fallback_action: None,
                suggestions: suggestions_for(kind),
            }
        } else {
            let (strategy, pattern) = self.select_strategy(kind, attempt);
            self.build_outcome(err, kind, strategy, pattern, attempt)
        };

        match outcome.action {
            RecoveryAction::Retry => tracing::warn!(
                task_id = %ctx.task_id,
                kind = %kind,
                attempt,
                delay_ms = outcome.delay_ms.unwrap_or(0),
                "recovery: retry scheduled"
            ),
            RecoveryAction::Abort | RecoveryAction::CircuitBreakerOpen => tracing::error!(
                task_id = %ctx.task_id,
                kind = %kind,
                error = %err,
                "recovery: giving up"
            ),
            _ => tracing::info!(
                task_id = %ctx.task_id,
                kind = %kind,
                action = ?outcome.action,
                "recovery outcome"
            ),
        }

        {
            let mut stats = self.stats.lock().await;
            stats.total_errors += 1;
            *stats.error_kinds.entry(kind).or_insert(0) += 1;
            if let Some(s) = outcome.strategy {
                *stats.strategies.entry(s).or_insert(0) += 1;
            }
            if outcome.success {
                stats.recovered_errors += 1;
            } else {
                stats.failed_recoveries += 1;
            }
        }

        self.history.write().await.push(
            &ctx.task_id,
            RecoveryRecord {
                todo_id: ctx.todo_id.clone(),
                tool_name: ctx.tool_name.clone(),
                error: err.to_string(),
                error_kind: kind,
                attempt,
                action: outcome.action,
                at: Utc::now(),
            },
        );

        outcome
    }

    fn build_outcome(
        &self,
        err: &EngineError,
        kind: ErrorKind,
        strategy: RecoveryStrategy,
        pattern: Option<&ErrorPattern>,
        attempt: u32,
    ) -> RecoveryOutcome {
        let base = RecoveryOutcome {
            action: RecoveryAction::Abort,
            strategy: Some(strategy),
            error_kind: kind,
            success: false,
            should_continue: false,
            message: String::new(),
            delay_ms: None,
            next_attempt: None,
            fallback_action: None,
            suggestions: Vec::new(),
        };
        match strategy {
            RecoveryStrategy::Retry => {
                let delay = self
                    .backoff
                    .delay(attempt, pattern.and_then(|p| p.backoff_factor));
                RecoveryOutcome {
                    action: RecoveryAction::Retry,
                    success: true,
                    should_continue: true,
                    message: format!("Retrying in {:.2}s", delay.as_secs_f64()),
                    delay_ms: Some(delay.as_millis() as u64),
                    next_attempt: Some(attempt + 1),
                    ..base
                }
            }
            RecoveryStrategy::Fallback => {
                let action = pattern
                    .and_then(|p| p.fallback_action.clone())
                    .unwrap_or_else(|| "use_default_behavior".to_string());
                RecoveryOutcome {
                    action: RecoveryAction::Fallback,
                    success: true,
                    should_continue: true,
                    message: format!("Falling back to '{action}' after: {err}"),
                    fallback_action: Some(action),
                    ..base
                }
            }
            RecoveryStrategy::Skip => RecoveryOutcome {
                action: RecoveryAction::Skip,
                success: true,
                should_continue: true,
                message: format!("Skipped step after: {err}"),
                ..base
            },
            RecoveryStrategy::Abort => RecoveryOutcome {
                message: format!("Unrecoverable {kind} error: {err}"),
                suggestions: suggestions_for(kind),
                ..base
            },
            RecoveryStrategy::Manual => RecoveryOutcome {
                action: RecoveryAction::ManualInterventionRequired,
                should_continue: true,
                message: format!("Manual intervention required for {kind} error: {err}"),
                suggestions: suggestions_for(kind),
                ..base
            },
        }
    }

    pub async fn statistics(&self) -> RecoveryStats {
        let mut stats = self.stats.lock().await.clone();
        stats.success_rate =
            stats.recovered_errors as f64 / stats.total_errors.max(1) as f64 * 100.0;
        stats.open_circuit_breakers = self.breakers.open_count().await;
        stats
    }

    pub async fn reset_circuit_breaker(&self, tool: &str) -> bool {
        self.breakers.reset(tool).await
    }

    pub async fn history(&self, task_id: &str) -> Vec<RecoveryRecord> {
        self.history
            .read()
            .await
            .records
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// 各类错误的人工处理建议
pub fn suggestions_for(kind: ErrorKind) -> Vec<String> {
    let items: &[&str] = match kind {
        ErrorKind::Permission => &[
            "Check file or directory permissions",
            "Confirm the task context grants the required permission",
            "Re-run with a user that has access",
        ],
        ErrorKind::FileSystem => &[
            "Check that the file exists",
            "Confirm the path is relative to the working directory",
            "Check available disk space",
        ],
        ErrorKind::Network => &[
            "Check network connectivity",
            "Confirm the target service is reachable",
            "Check proxy or firewall settings",
        ],
        ErrorKind::Timeout => &[
            "Increase the tool timeout",
            "Check system load",
            "Split the step into smaller steps",
        ],
        ErrorKind::Validation => &[
            "Check the step parameters",
            "Regenerate the plan with corrected dependencies",
        ],
        _ => &[
            "Inspect the detailed error log",
            "Check the input parameters",
        ],
    };
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ErrorRecoveryEngine {
        let cfg = RecoverySection::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            cfg.breaker_threshold,
            cfg.breaker_cooldown(),
        ));
        ErrorRecoveryEngine::new(&cfg, breakers)
    }

    fn tool_err(msg: &str) -> EngineError {
        EngineError::ToolExecutionFailed {
            tool: "file_read".into(),
            message: msg.into(),
        }
    }

    #[test]
    fn test_classify_by_keyword() {
        let e = engine();
        assert_eq!(e.classify(&tool_err("Connection refused")), ErrorKind::Network);
        assert_eq!(e.classify(&tool_err("request timed out")), ErrorKind::Timeout);
        assert_eq!(e.classify(&tool_err("No such file or directory")), ErrorKind::FileSystem);
        assert_eq!(e.classify(&tool_err("boom")), ErrorKind::Tool);
        assert_eq!(e.classify(&EngineError::Other("boom".into())), ErrorKind::Unknown);
    }

    #[test]
    fn test_select_strategy_exhaustion() {
        let e = engine();
        assert_eq!(e.select_strategy(ErrorKind::Network, 1).0, RecoveryStrategy::Retry);
        assert_eq!(e.select_strategy(ErrorKind::Network, 2).0, RecoveryStrategy::Retry);
        assert_eq!(e.select_strategy(ErrorKind::Network, 3).0, RecoveryStrategy::Abort);
        assert_eq!(e.select_strategy(ErrorKind::FileSystem, 5).0, RecoveryStrategy::Fallback);
        assert_eq!(e.select_strategy(ErrorKind::Validation, 1).0, RecoveryStrategy::Abort);
        assert_eq!(e.select_strategy(ErrorKind::Permission, 1).0, RecoveryStrategy::Manual);
        assert_eq!(e.select_strategy(ErrorKind::Unknown, 3).0, RecoveryStrategy::Retry);
        assert_eq!(e.select_strategy(ErrorKind::Unknown, 4).0, RecoveryStrategy::Abort);
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let policy = BackoffPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..40 {
            let d = policy.delay(attempt, None);
            assert!(d >= prev);
            assert!(d <= Duration::from_secs(30));
            prev = d;
        }
        assert_eq!(policy.delay(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay(3, None), Duration::from_secs_f64(2.25));
        assert_eq!(policy.delay(1000, Some(2.0)), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_handle_manual_has_suggestions() {
        let e = engine();
        let ctx = RecoveryContext::new("t1").todo("a");
        let outcome = e.handle(&EngineError::PermissionDenied("/etc".into()), &ctx).await;
        assert_eq!(outcome.action, RecoveryAction::ManualInterventionRequired);
        assert!(!outcome.success);
        assert!(!outcome.suggestions.is_empty());
        assert_eq!(e.history("t1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_stops_recovery() {
        let e = engine();
        for _ in 0..5 {
            e.breakers().record_failure("file_read").await;
        }
        let ctx = RecoveryContext::new("t1").tool(Some("file_read".into()));
        let outcome = e.handle(&tool_err("timeout"), &ctx).await;
        assert_eq!(outcome.action, RecoveryAction::CircuitBreakerOpen);
        assert!(!outcome.should_continue);

        let stats = e.statistics().await;
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.failed_recoveries, 1);
        assert_eq!(stats.open_circuit_breakers, 1);

        assert!(e.reset_circuit_breaker("file_read").await);
        let outcome = e.handle(&tool_err("timeout"), &ctx).await;
        assert_eq!(outcome.action, RecoveryAction::Retry);
        assert_eq!(outcome.next_attempt, Some(2));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let cfg = RecoverySection {
            history_max_tasks: 2,
            history_per_task: 3,
            ..RecoverySection::default()
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(60)));
        let e = ErrorRecoveryEngine::new(&cfg, breakers);

        for attempt in 1..=5 {
            let mut ctx = RecoveryContext::new("t1");
            ctx.attempt = attempt;
            e.handle(&tool_err("boom"), &ctx).await;
        }
        let kept: Vec<u32> = e.history("t1").await.iter().map(|r| r.attempt).collect();
        assert_eq!(kept, vec![3, 4, 5]);

        e.handle(&tool_err("boom"), &RecoveryContext::new("t2")).await;
        e.handle(&tool_err("boom"), &RecoveryContext::new("t3")).await;
        assert!(e.history("t1").await.is_empty());
        assert_eq!(e.history("t2").await.len(), 1);
        assert_eq!(e.history("t3").await.len(), 1);
        // 统计不受裁剪影响
        assert_eq!(e.statistics().await.total_errors, 7);
    }

    #[test]
    fn test_configured_patterns_replace_builtin_table() {
        let cfg = RecoverySection {
            patterns: vec![ErrorPatternConfig {
                kind: ErrorKind::Network,
                keywords: vec!["Bad Gateway".into()],
                strategy: RecoveryStrategy::Retry,
                max_retries: 5,
                backoff_factor: None,
                fallback_action: None,
            }],
            ..RecoverySection::default()
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(60)));
        let e = ErrorRecoveryEngine::new(&cfg, breakers);

        assert_eq!(e.classify(&tool_err("502 bad gateway")), ErrorKind::Network);
        // 内置表里的 timeout 关键字不再生效
        assert_eq!(e.classify(&tool_err("request timed out")), ErrorKind::Tool);
        assert_eq!(e.select_strategy(ErrorKind::Network, 5).0, RecoveryStrategy::Retry);
        assert_eq!(e.select_strategy(ErrorKind::Network, 6).0, RecoveryStrategy::Abort);
    }
}
