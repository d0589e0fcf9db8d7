//! 工具生命周期注册表
//!
//! 状态机：`Unregistered → Registered → Initializing → Ready ⇄ Unavailable/Error ; Ready → Unloading → Unloaded`。
//! 同一工具的生命周期变更由按名字的锁串行化，表级 RwLock 只在短临界区内持有，不跨越工具钩子的 await。
//! 所有变更写入有界事件日志并回调订阅者；后台健康检查循环由 start/stop_health_monitoring 持有与回收。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LifecycleSection;
use crate::core::KeyedLocks;
use crate::tools::Tool;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Tool '{tool}' depends on '{dependency}', which is not registered and ready")]
    DependencyError { tool: String, dependency: String },

    #[error("Tool not registered: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Unregistered,
    Registered,
    Initializing,
    Ready,
    Unavailable,
    Error,
    Unloading,
    Unloaded,
}

impl ToolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolState::Unregistered => "unregistered",
            ToolState::Registered => "registered",
            ToolState::Initializing => "initializing",
            ToolState::Ready => "ready",
            ToolState::Unavailable => "unavailable",
            ToolState::Error => "error",
            ToolState::Unloading => "unloading",
            ToolState::Unloaded => "unloaded",
        }
    }

    /// 健康检查循环会探测的状态
    fn is_monitored(&self) -> bool {
        matches!(self, ToolState::Ready | ToolState::Unavailable | ToolState::Error)
    }
}

/// 健康计数
#[derive(Debug, Clone, Serialize)]
pub struct ToolHealth {
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub error_count: u64,
    pub success_count: u64,
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl ToolHealth {
    fn new() -> Self {
        Self {
            last_check: None,
            response_time_ms: None,
            error_count: 0,
            success_count: 0,
            last_error: None,
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Registered,
    Initializing,
    Ready,
    InitializationFailed,
    BecameUnavailable,
    Recovered,
    HealthCheckFailed,
    Unloading,
    Unloaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub tool_name: String,
    pub kind: LifecycleEventKind,
    pub old_state: Option<ToolState>,
    pub new_state: ToolState,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

pub type LifecycleCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatistics {
    pub tool_states: BTreeMap<String, usize>,
    pub total_tools: usize,
    pub healthy_tools: usize,
    pub total_health_checks: u64,
    pub total_errors: u64,
    pub dependencies_count: usize,
    pub events_count: usize,
    pub monitoring: bool,
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    state: ToolState,
    health: ToolHealth,
    metadata: Map<String, Value>,
}

struct HealthMonitor {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// 探测结果
enum ProbeOutcome {
    Healthy,
    Unhealthy,
    Failed(String),
}

pub struct ToolLifecycleRegistry {
    tools: RwLock<HashMap<String, ToolEntry>>,
    /// tool -> 其依赖的工具
    dependencies: RwLock<HashMap<String, HashSet<String>>>,
    unloaded: RwLock<HashSet<String>>,
    locks: KeyedLocks,
    journal: Mutex<VecDeque<LifecycleEvent>>,
    callbacks: RwLock<Vec<LifecycleCallback>>,
    journal_capacity: usize,
    journal_trim_to: usize,
    health_interval: Duration,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl ToolLifecycleRegistry {
    pub fn new(cfg: &LifecycleSection) -> Self {
        let capacity = cfg.journal_capacity.max(1);
        Self {
            tools: RwLock::new(HashMap::new()),
            dependencies: RwLock::new(HashMap::new()),
            unloaded: RwLock::new(HashSet::new()),
            locks: KeyedLocks::new(),
            journal: Mutex::new(VecDeque::new()),
            callbacks: RwLock::new(Vec::new()),
            journal_capacity: capacity,
            journal_trim_to: cfg.journal_trim_to.min(capacity),
            health_interval: Duration::from_secs(cfg.health_check_interval_secs.max(1)),
            monitor: Mutex::new(None),
        }
    }

    /// 注册并立即尝试初始化。
    ///
    /// 同名工具已 Ready 且未要求覆盖时返回 Ok(false)；依赖未注册或未就绪返回 DependencyError。
    /// 返回 Ok(true) 只表示已登记，初始化结果看 `state`。
    pub async fn register(
        &self,
        tool: Arc<dyn Tool>,
        dependencies: &[&str],
        overwrite: bool,
    ) -> Result<bool, RegistryError> {
        self.register_with_metadata(tool, dependencies, overwrite, Map::new())
            .await
    }

    pub async fn register_with_metadata(
        &self,
        tool: Arc<dyn Tool>,
        dependencies: &[&str],
        overwrite: bool,
        metadata: Map<String, Value>,
    ) -> Result<bool, RegistryError> {
        let name = tool.name().to_string();
        let _guard = self.locks.lock(&name).await;

        let previous = self.tools.read().await.get(&name).map(|e| (e.state, e.tool.clone()));
        if let Some((ToolState::Ready, _)) = &previous {
            if !overwrite {
                tracing::warn!(tool = %name, "tool already registered and ready, skipping");
                return Ok(false);
            }
        }

        for dep in dependencies {
            let dep_ready = *dep != name && self.state(dep).await == ToolState::Ready;
            if !dep_ready {
                tracing::error!(tool = %name, dependency = %dep, "tool registration rejected");
                return Err(RegistryError::DependencyError {
                    tool: name,
                    dependency: dep.to_string(),
                });
            }
        }

        if let Some((_, old_tool)) = &previous {
            if let Err(e) = old_tool.cleanup().await {
                tracing::warn!(tool = %name, error = %e, "cleanup of replaced tool failed");
            }
            tracing::warn!(tool = %name, "overwriting registered tool");
        }

        self.tools.write().await.insert(
            name.clone(),
            ToolEntry {
                tool,
                state: ToolState::Registered,
                health: ToolHealth::new(),
                metadata: metadata.clone(),
            },
        );
        let deps: HashSet<String> = dependencies.iter().map(|d| d.to_string()).collect();
        {
            let mut edges = self.dependencies.write().await;
            if deps.is_empty() {
                edges.remove(&name);
            } else {
                edges.insert(name.clone(), deps.clone());
            }
        }
        self.unloaded.write().await.remove(&name);

        let old_state = previous
            .map(|(s, _)| s)
            .unwrap_or(ToolState::Unregistered);
        self.emit(
            &name,
            LifecycleEventKind::Registered,
            Some(old_state),
            ToolState::Registered,
            json!({ "dependencies": deps, "metadata": metadata }),
        )
        .await;
        tracing::info!(tool = %name, "tool registered");

        self.initialize_locked(&name).await;
        Ok(true)
    }

    /// 重新初始化：依赖检查、initialize 钩子、健康探测，通过则 Ready，否则 Error
    pub async fn initialize(&self, name: &str) -> Result<bool, RegistryError> {
        let _guard = self.locks.lock(name).await;
        if !self.tools.read().await.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(self.initialize_locked(name).await)
    }

    async fn initialize_locked(&self, name: &str) -> bool {
        let Some((tool, old)) = self.entry_snapshot(name).await else {
            return false;
        };
        self.set_state(name, ToolState::Initializing).await;
        self.emit(name, LifecycleEventKind::Initializing, Some(old), ToolState::Initializing, Value::Null)
            .await;

        for dep in self.dependencies(name).await {
            if self.state(&dep).await != ToolState::Ready {
                let reason = format!("dependency '{}' is not ready", dep);
                self.fail_initialization(name, &reason).await;
                return false;
            }
        }

        if let Err(e) = tool.initialize().await {
            self.fail_initialization(name, &e).await;
            return false;
        }

        match self.probe(name, &tool).await {
            ProbeOutcome::Healthy => {
                self.set_state(name, ToolState::Ready).await;
                self.emit(name, LifecycleEventKind::Ready, Some(ToolState::Initializing), ToolState::Ready, Value::Null)
                    .await;
                tracing::info!(tool = %name, "tool ready");
                true
            }
            ProbeOutcome::Unhealthy => {
                self.fail_initialization(name, "initial health check failed").await;
                false
            }
            ProbeOutcome::Failed(e) => {
                self.fail_initialization(name, &e).await;
                false
            }
        }
    }

    async fn fail_initialization(&self, name: &str, reason: &str) {
        tracing::error!(tool = %name, error = %reason, "tool initialization failed");
        self.set_state(name, ToolState::Error).await;
        self.emit(
            name,
            LifecycleEventKind::InitializationFailed,
            Some(ToolState::Initializing),
            ToolState::Error,
            json!({ "error": reason }),
        )
        .await;
    }

    /// 卸载工具；仍被其他工具依赖时拒绝并返回 false，未注册视为已卸载
    pub async fn unregister(&self, name: &str) -> bool {
        let _guard = self.locks.lock(name).await;
        let Some((tool, old)) = self.entry_snapshot(name).await else {
            tracing::warn!(tool = %name, "unregister: tool not registered");
            return true;
        };

        let dependents = self.dependents(name).await;
        if !dependents.is_empty() {
            tracing::error!(tool = %name, dependents = ?dependents, "cannot unregister tool with dependents");
            return false;
        }

        self.set_state(name, ToolState::Unloading).await;
        self.emit(name, LifecycleEventKind::Unloading, Some(old), ToolState::Unloading, Value::Null)
            .await;

        if let Err(e) = tool.cleanup().await {
            tracing::error!(tool = %name, error = %e, "tool cleanup failed");
            self.set_state(name, ToolState::Error).await;
            return false;
        }

        self.tools.write().await.remove(name);
        self.dependencies.write().await.remove(name);
        self.unloaded.write().await.insert(name.to_string());
        self.emit(name, LifecycleEventKind::Unloaded, Some(ToolState::Unloading), ToolState::Unloaded, Value::Null)
            .await;
        tracing::info!(tool = %name, "tool unloaded");
        true
    }

    /// 当前状态；从未注册为 Unregistered，卸载后为 Unloaded
    pub async fn state(&self, name: &str) -> ToolState {
        if let Some(entry) = self.tools.read().await.get(name) {
            return entry.state;
        }
        if self.unloaded.read().await.contains(name) {
            ToolState::Unloaded
        } else {
            ToolState::Unregistered
        }
    }

    pub async fn health(&self, name: &str) -> Option<ToolHealth> {
        self.tools.read().await.get(name).map(|e| e.health.clone())
    }

    pub async fn metadata(&self, name: &str) -> Option<Map<String, Value>> {
        self.tools.read().await.get(name).map(|e| e.metadata.clone())
    }

    /// Ready 工具名，按名字排序
    pub async fn available_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.state == ToolState::Ready)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// 任意状态的已注册工具
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).map(|e| e.tool.clone())
    }

    /// Ready 工具实例，按名字排序
    pub async fn ready_tools(&self) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        let mut ready: Vec<(&String, Arc<dyn Tool>)> = tools
            .iter()
            .filter(|(_, e)| e.state == ToolState::Ready)
            .map(|(n, e)| (n, e.tool.clone()))
            .collect();
        ready.sort_by(|a, b| a.0.cmp(b.0));
        ready.into_iter().map(|(_, t)| t).collect()
    }

    /// Ready 工具声明的全部能力（含工具名本身），去重排序
    pub async fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .ready_tools()
            .await
            .iter()
            .flat_map(|t| {
                let def = t.definition();
                std::iter::once(def.name.clone()).chain(def.capability_tags.iter().cloned())
            })
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    pub async fn dependencies(&self, name: &str) -> HashSet<String> {
        self.dependencies
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// 依赖 name 的工具
    pub async fn dependents(&self, name: &str) -> HashSet<String> {
        self.dependencies
            .read()
            .await
            .iter()
            .filter(|(_, deps)| deps.contains(name))
            .map(|(tool, _)| tool.clone())
            .collect()
    }

    /// 立即探测指定工具或全部工具，返回各自是否健康
    pub async fn force_health_check(&self, name: Option<&str>) -> HashMap<String, bool> {
        let names: Vec<String> = match name {
            Some(n) => vec![n.to_string()],
            None => self.tools.read().await.keys().cloned().collect(),
        };
        let mut results = HashMap::new();
        for n in names {
            if let Some(healthy) = self.check_tool(&n, false).await {
                results.insert(n, healthy);
            }
        }
        results
    }

    /// 对 Ready / Unavailable / Error 的工具执行一轮探测
    pub async fn run_health_checks(&self) -> HashMap<String, bool> {
        let names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        let mut results = HashMap::new();
        for n in names {
            if let Some(healthy) = self.check_tool(&n, true).await {
                results.insert(n, healthy);
            }
        }
        results
    }

    async fn check_tool(&self, name: &str, monitored_only: bool) -> Option<bool> {
        let _guard = self.locks.lock(name).await;
        let (tool, state) = self.entry_snapshot(name).await?;
        if monitored_only && !state.is_monitored() {
            return None;
        }
        let healthy = match self.probe(name, &tool).await {
            ProbeOutcome::Healthy => {
                if matches!(state, ToolState::Error | ToolState::Unavailable) {
                    self.set_state(name, ToolState::Ready).await;
                    self.emit(name, LifecycleEventKind::Recovered, Some(state), ToolState::Ready, Value::Null)
                        .await;
                    tracing::info!(tool = %name, from = state.as_str(), "tool recovered");
                }
                true
            }
            ProbeOutcome::Unhealthy => {
                if state == ToolState::Ready {
                    self.set_state(name, ToolState::Unavailable).await;
                    self.emit(
                        name,
                        LifecycleEventKind::BecameUnavailable,
                        Some(state),
                        ToolState::Unavailable,
                        Value::Null,
                    )
                    .await;
                    tracing::warn!(tool = %name, "tool unhealthy, marked unavailable");
                }
                false
            }
            ProbeOutcome::Failed(e) => {
                self.set_state(name, ToolState::Error).await;
                self.emit(
                    name,
                    LifecycleEventKind::HealthCheckFailed,
                    Some(state),
                    ToolState::Error,
                    json!({ "error": e }),
                )
                .await;
                tracing::error!(tool = %name, error = %e, "tool health check failed");
                false
            }
        };
        Some(healthy)
    }

    /// 调用 health_check 并更新计数
    async fn probe(&self, name: &str, tool: &Arc<dyn Tool>) -> ProbeOutcome {
        let start = Instant::now();
        let result = tool.health_check().await;
        let elapsed = start.elapsed().as_millis() as u64;

        let mut tools = self.tools.write().await;
        let Some(entry) = tools.get_mut(name) else {
            return ProbeOutcome::Failed("tool removed during health check".into());
        };
        let health = &mut entry.health;
        health.last_check = Some(Utc::now());
        health.response_time_ms = Some(elapsed);
        match result {
            Ok(true) => {
                health.success_count += 1;
                ProbeOutcome::Healthy
            }
            Ok(false) => {
                health.error_count += 1;
                health.last_error = Some("health check failed".into());
                ProbeOutcome::Unhealthy
            }
            Err(e) => {
                health.error_count += 1;
                health.last_error = Some(e.clone());
                ProbeOutcome::Failed(e)
            }
        }
    }

    pub async fn add_callback(&self, callback: LifecycleCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// 事件日志；limit 取最近的若干条
    pub async fn lifecycle_events(
        &self,
        tool: Option<&str>,
        kind: Option<LifecycleEventKind>,
        limit: Option<usize>,
    ) -> Vec<LifecycleEvent> {
        let journal = self.journal.lock().await;
        let matched: Vec<LifecycleEvent> = journal
            .iter()
            .filter(|e| tool.map_or(true, |t| e.tool_name == t))
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect();
        match limit {
            Some(n) if n < matched.len() => matched[matched.len() - n..].to_vec(),
            _ => matched,
        }
    }

    pub async fn statistics(&self) -> LifecycleStatistics {
        let tools = self.tools.read().await;
        let mut tool_states = BTreeMap::new();
        for entry in tools.values() {
            *tool_states.entry(entry.state.as_str().to_string()).or_insert(0) += 1;
        }
        let unloaded = self.unloaded.read().await.len();
        if unloaded > 0 {
            tool_states.insert(ToolState::Unloaded.as_str().to_string(), unloaded);
        }
        LifecycleStatistics {
            total_tools: tools.len(),
            healthy_tools: tools.values().filter(|e| e.state == ToolState::Ready).count(),
            total_health_checks: tools
                .values()
                .map(|e| e.health.success_count + e.health.error_count)
                .sum(),
            total_errors: tools.values().map(|e| e.health.error_count).sum(),
            tool_states,
            dependencies_count: self.dependencies.read().await.len(),
            events_count: self.journal.lock().await.len(),
            monitoring: self.monitor.lock().await.is_some(),
        }
    }

    /// 启动周期健康检查；重复调用无效
    pub async fn start_health_monitoring(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let registry = Arc::clone(self);
        let loop_token = token.clone();
        let interval = self.health_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let results = registry.run_health_checks().await;
                        tracing::debug!(checked = results.len(), "health check pass finished");
                    }
                }
            }
        });
        *slot = Some(HealthMonitor { handle, token });
        tracing::info!(interval_secs = interval.as_secs(), "tool health monitoring started");
    }

    /// 停止健康检查并等待循环退出
    pub async fn stop_health_monitoring(&self) {
        let running = self.monitor.lock().await.take();
        if let Some(HealthMonitor { handle, token }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "health monitor ended abnormally");
            }
            tracing::info!("tool health monitoring stopped");
        }
    }

    /// 按依赖逆序卸载全部工具
    pub async fn shutdown(&self) {
        self.stop_health_monitoring().await;
        loop {
            let names: Vec<String> = self.tools.read().await.keys().cloned().collect();
            if names.is_empty() {
                break;
            }
            let mut progressed = false;
            for name in names {
                if self.dependents(&name).await.is_empty() && self.unregister(&name).await {
                    progressed = true;
                }
            }
            if !progressed {
                tracing::warn!("some tools could not be unloaded during shutdown");
                break;
            }
        }
    }

    async fn entry_snapshot(&self, name: &str) -> Option<(Arc<dyn Tool>, ToolState)> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|e| (e.tool.clone(), e.state))
    }

    async fn set_state(&self, name: &str, state: ToolState) {
        if let Some(entry) = self.tools.write().await.get_mut(name) {
            entry.state = state;
        }
    }

    async fn emit(
        &self,
        name: &str,
        kind: LifecycleEventKind,
        old_state: Option<ToolState>,
        new_state: ToolState,
        data: Value,
    ) {
        let event = LifecycleEvent {
            tool_name: name.to_string(),
            kind,
            old_state,
            new_state,
            timestamp: Utc::now(),
            data,
        };
        {
            let mut journal = self.journal.lock().await;
            journal.push_back(event.clone());
            if journal.len() > self.journal_capacity {
                let excess = journal.len() - self.journal_trim_to;
                journal.drain(..excess);
            }
        }
        for callback in self.callbacks.read().await.iter() {
            callback(&event);
        }
        tracing::debug!(tool = %name, event = ?kind, "lifecycle event");
    }
}
