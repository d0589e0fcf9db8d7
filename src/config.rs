//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKFORGE__*` 覆盖（双下划线表示嵌套，如 `TASKFORGE__TASK__FAILED_TODO_POLICY=requeue`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{ErrorKind, RecoveryStrategy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub concurrency: ConcurrencySection,
    pub interaction: InteractionSection,
    pub task: TaskSection,
    pub recovery: RecoverySection,
    pub state: StateSection,
    pub lifecycle: LifecycleSection,
}

/// [app] 段：应用名、工作目录、事件流缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工具沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 单个任务事件流的 channel 容量
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: None,
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_event_buffer() -> usize {
    64
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// [concurrency] 段：全局工具并发上限与单次调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 串行批次内某个调用失败时是否停止该批次剩余调用
    #[serde(default)]
    pub stop_batch_on_failure: bool,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            max_parallel_tools: default_max_parallel_tools(),
            tool_timeout_secs: default_tool_timeout_secs(),
            stop_batch_on_failure: false,
        }
    }
}

fn default_max_parallel_tools() -> usize {
    10
}

fn default_tool_timeout_secs() -> u64 {
    120
}

/// [interaction] 段：是否允许中断、等待用户响应的超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InteractionSection {
    #[serde(default = "default_true")]
    pub allow_user_interruption: bool,
    #[serde(default = "default_user_response_timeout_secs")]
    pub user_response_timeout_secs: u64,
}

impl Default for InteractionSection {
    fn default() -> Self {
        Self {
            allow_user_interruption: true,
            user_response_timeout_secs: default_user_response_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_user_response_timeout_secs() -> u64 {
    300
}

/// 失败 TodoItem 的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailedTodoPolicy {
    /// 保持 Failed，继续下一个就绪项
    #[default]
    Continue,
    /// 恢复策略为 retry 且未超过次数上限时，重置为新一轮 Pending
    Requeue,
    /// 首个失败即停止调度循环
    StopOnFirstFailure,
}

/// [task] 段：分解阈值、TodoList 上限、失败处理
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    /// 复杂度评分达到该值时需要分解（规则判定器使用）
    #[serde(default = "default_complexity_threshold")]
    pub complexity_threshold: u8,
    #[serde(default = "default_max_todo_items")]
    pub max_todo_items: usize,
    #[serde(default)]
    pub failed_todo_policy: FailedTodoPolicy,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// 写入 ExecutionContext 的单任务最长执行时间（秒）
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            complexity_threshold: default_complexity_threshold(),
            max_todo_items: default_max_todo_items(),
            failed_todo_policy: FailedTodoPolicy::default(),
            max_retry_attempts: default_max_retry_attempts(),
            max_execution_time_secs: default_max_execution_time_secs(),
        }
    }
}

fn default_complexity_threshold() -> u8 {
    3
}

fn default_max_todo_items() -> usize {
    20
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_max_execution_time_secs() -> u64 {
    300
}

/// [[recovery.patterns]] 条目：关键字命中后归入 kind
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPatternConfig {
    pub kind: ErrorKind,
    pub keywords: Vec<String>,
    pub strategy: RecoveryStrategy,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_factor: Option<f64>,
    #[serde(default)]
    pub fallback_action: Option<String>,
}

/// [recovery] 段：退避参数、熔断阈值、错误模式表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    /// 未命中任何错误模式时的重试上限
    #[serde(default = "default_max_retry_attempts")]
    pub default_max_retries: u32,
    /// 保留恢复记录的任务数上限，超出时丢弃最早的任务
    #[serde(default = "default_history_max_tasks")]
    pub history_max_tasks: usize,
    /// 单个任务保留的最近恢复记录数
    #[serde(default = "default_history_per_task")]
    pub history_per_task: usize,
    /// 为空时使用内置模式表
    #[serde(default)]
    pub patterns: Vec<ErrorPatternConfig>,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            default_max_retries: default_max_retry_attempts(),
            history_max_tasks: default_history_max_tasks(),
            history_per_task: default_history_per_task(),
            patterns: Vec::new(),
        }
    }
}

impl RecoverySection {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

fn default_history_max_tasks() -> usize {
    256
}

fn default_history_per_task() -> usize {
    50
}

/// 状态存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    File,
    Sqlite,
}

/// [state] 段：后端选择、路径、自动刷盘间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSection {
    #[serde(default)]
    pub backend: StateBackend,
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            dir: default_state_dir(),
            db_path: default_db_path(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("taskforge_state")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("taskforge_state.db")
}

fn default_flush_interval_secs() -> u64 {
    30
}

/// [lifecycle] 段：周期健康检查与事件日志容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    /// 引擎构建时是否启动周期健康检查
    #[serde(default = "default_true")]
    pub health_monitoring: bool,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// 生命周期事件日志达到该容量时裁剪
    #[serde(default = "default_journal_capacity")]
    pub journal_capacity: usize,
    /// 裁剪后保留的最近事件数
    #[serde(default = "default_journal_trim_to")]
    pub journal_trim_to: usize,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            health_monitoring: true,
            health_check_interval_secs: default_health_check_interval_secs(),
            journal_capacity: default_journal_capacity(),
            journal_trim_to: default_journal_trim_to(),
        }
    }
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_journal_capacity() -> usize {
    1000
}

fn default_journal_trim_to() -> usize {
    500
}

/// 从 config 目录加载配置，环境变量 TASKFORGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKFORGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKFORGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
