//! 引擎构建器：统一的组件初始化逻辑
//!
//! 内置工具、自定义工具、判定器与状态后端在这里组装成 TaskEngine；
//! 演示程序与测试共用同一套装配顺序。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::core::{
    CircuitBreakerRegistry, EngineError, ErrorRecoveryEngine, InteractionGate, ShutdownCoordinator,
    ShutdownManager, StateFlushCleanup, TaskScheduler, ToolRegistryCleanup,
};
use crate::engine::{EngineShared, TaskEngine};
use crate::oracle::{ComplexityOracle, RuleBasedOracle};
use crate::state::{open_store, StateManager, StateStore};
use crate::tools::{builtin_tools, Tool, ToolExecutor, ToolLifecycleRegistry, ToolOrchestrator};

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    oracle: Option<Arc<dyn ComplexityOracle>>,
    store: Option<Arc<dyn StateStore>>,
    tools: Vec<(Arc<dyn Tool>, Vec<String>)>,
    builtin_tools: bool,
    health_monitoring: Option<bool>,
    auto_flush: bool,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            oracle: None,
            store: None,
            tools: Vec::new(),
            builtin_tools: true,
            health_monitoring: None,
            auto_flush: false,
        }
    }

    /// 替换默认的规则判定器
    pub fn with_oracle(mut self, oracle: Arc<dyn ComplexityOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// 指定状态后端；未指定时按 [state] 配置打开
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 注册自定义工具，同名时覆盖内置工具
    pub fn with_tool(self, tool: Arc<dyn Tool>) -> Self {
        self.with_tool_dependencies(tool, &[])
    }

    pub fn with_tool_dependencies(mut self, tool: Arc<dyn Tool>, dependencies: &[&str]) -> Self {
        self.tools
            .push((tool, dependencies.iter().map(|d| d.to_string()).collect()));
        self
    }

    pub fn without_builtin_tools(mut self) -> Self {
        self.builtin_tools = false;
        self
    }

    /// 是否启动周期健康检查；未指定时取 [lifecycle] health_monitoring
    pub fn with_health_monitoring(mut self, enable: bool) -> Self {
        self.health_monitoring = Some(enable);
        self
    }

    /// 是否启动周期刷盘
    pub fn with_auto_flush(mut self, enable: bool) -> Self {
        self.auto_flush = enable;
        self
    }

    pub async fn build(self) -> Result<TaskEngine, EngineError> {
        let cfg = self.config;

        let registry = Arc::new(ToolLifecycleRegistry::new(&cfg.lifecycle));
        if self.builtin_tools {
            for tool in builtin_tools() {
                registry.register(tool, &[], true).await?;
            }
        }
        for (tool, deps) in self.tools {
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            let name = tool.name().to_string();
            if !registry.register(tool, &deps, true).await? {
                tracing::warn!(tool = %name, "tool was not registered");
            }
        }

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            cfg.recovery.breaker_threshold,
            cfg.recovery.breaker_cooldown(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(cfg.concurrency.max_parallel_tools));
        let executor = Arc::new(ToolExecutor::new(
            registry.clone(),
            scheduler,
            breakers.clone(),
            cfg.concurrency.tool_timeout_secs,
        ));
        let orchestrator = Arc::new(ToolOrchestrator::new(executor, &cfg.concurrency));
        let recovery = Arc::new(ErrorRecoveryEngine::new(&cfg.recovery, breakers));

        let store = match self.store {
            Some(store) => store,
            None => open_store(&cfg.state).await?,
        };
        let state = Arc::new(
            StateManager::new(store)
                .with_flush_interval(Duration::from_secs(cfg.state.flush_interval_secs.max(1))),
        );
        if self.auto_flush {
            state.start_auto_flush().await;
        }
        if self.health_monitoring.unwrap_or(cfg.lifecycle.health_monitoring) {
            registry.start_health_monitoring().await;
        }

        let oracle = self
            .oracle
            .unwrap_or_else(|| Arc::new(RuleBasedOracle::new(&cfg.task)));
        let gate = Arc::new(InteractionGate::new(&cfg.interaction));

        let shutdown = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
        coordinator.register(StateFlushCleanup::new(state.clone()));
        coordinator.register(ToolRegistryCleanup::new(registry.clone()));

        tracing::info!(
            oracle = oracle.name(),
            state_backend = state.store().name(),
            capabilities = registry.capabilities().await.len(),
            "task engine ready"
        );

        Ok(TaskEngine {
            shared: Arc::new(EngineShared {
                config: cfg,
                oracle,
                registry,
                orchestrator,
                recovery,
                state,
                gate,
                shutdown,
                coordinator,
                active: RwLock::new(HashMap::new()),
            }),
        })
    }
}
