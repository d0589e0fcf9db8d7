//! 按工具名的熔断器
//!
//! Closed 下连续失败达到阈值即 Open；Open 期间调用被直接拒绝；冷却期满后转 HalfOpen，
//! 只放行一次试探调用：成功则 Closed，失败则重新 Open 并重新计算冷却。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// try_acquire 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// 正常放行
    Allowed,
    /// 半开状态下的唯一试探调用
    Trial,
    /// 熔断中，剩余冷却时间
    Rejected { retry_after: Duration },
}

impl BreakerDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, BreakerDecision::Rejected { .. })
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

/// 熔断器集合：每个工具一把锁，互不阻塞
pub struct CircuitBreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    breakers: RwLock<HashMap<String, Arc<Mutex<Breaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, tool: &str) -> Arc<Mutex<Breaker>> {
        if let Some(b) = self.breakers.read().await.get(tool) {
            return b.clone();
        }
        self.breakers
            .write()
            .await
            .entry(tool.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new())))
            .clone()
    }

    /// 调用前询问是否放行
    pub async fn try_acquire(&self, tool: &str) -> BreakerDecision {
        let entry = self.entry(tool).await;
        let mut b = entry.lock().await;
        let now = Instant::now();
        match b.state {
            BreakerState::Closed => BreakerDecision::Allowed,
            BreakerState::Open => {
                let opened_at = b.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    b.state = BreakerState::HalfOpen;
                    b.trial_started = Some(now);
                    tracing::info!(tool = %tool, "circuit breaker half-open, allowing trial call");
                    BreakerDecision::Trial
                } else {
                    BreakerDecision::Rejected {
                        retry_after: self.cooldown - elapsed,
                    }
                }
            }
            BreakerState::HalfOpen => {
                // 试探调用被取消而未回报时，冷却期过后允许新的试探
                let stale = b
                    .trial_started
                    .map(|t| now.saturating_duration_since(t) >= self.cooldown)
                    .unwrap_or(true);
                if stale {
                    b.trial_started = Some(now);
                    BreakerDecision::Trial
                } else {
                    BreakerDecision::Rejected {
                        retry_after: Duration::ZERO,
                    }
                }
            }
        }
    }

    pub async fn record_success(&self, tool: &str) {
        let entry = self.entry(tool).await;
        let mut b = entry.lock().await;
        if b.state != BreakerState::Closed {
            tracing::info!(tool = %tool, "circuit breaker closed");
        }
        *b = Breaker::new();
    }

    /// 记录一次失败，返回记录后的状态
    pub async fn record_failure(&self, tool: &str) -> BreakerState {
        let entry = self.entry(tool).await;
        let mut b = entry.lock().await;
        b.consecutive_failures += 1;
        match b.state {
            BreakerState::HalfOpen => {
                b.state = BreakerState::Open;
                b.opened_at = Some(Instant::now());
                b.trial_started = None;
                tracing::warn!(tool = %tool, "circuit breaker re-opened after failed trial");
            }
            BreakerState::Closed if b.consecutive_failures >= self.threshold => {
                b.state = BreakerState::Open;
                b.opened_at = Some(Instant::now());
                tracing::warn!(
                    tool = %tool,
                    failures = b.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
        b.state
    }

    pub async fn state(&self, tool: &str) -> BreakerState {
        match self.breakers.read().await.get(tool) {
            Some(b) => b.lock().await.state,
            None => BreakerState::Closed,
        }
    }

    /// 手动复位；未记录过的工具返回 false
    pub async fn reset(&self, tool: &str) -> bool {
        let entry = match self.breakers.read().await.get(tool) {
            Some(b) => b.clone(),
            None => return false,
        };
        *entry.lock().await = Breaker::new();
        tracing::info!(tool = %tool, "circuit breaker reset");
        true
    }

    /// 非 Closed 的熔断器数量
    pub async fn open_count(&self) -> usize {
        let entries: Vec<_> = self.breakers.read().await.values().cloned().collect();
        let mut n = 0;
        for e in entries {
            if e.lock().await.state != BreakerState::Closed {
                n += 1;
            }
        }
        n
    }
}
