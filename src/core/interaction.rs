//! 交互闸门：中断请求、交互事件与用户响应
//!
//! TaskEngine 在每个 TodoItem 开始前调用 `check_interruption`；命中后 `open` 一个交互事件并
//! `wait_for_response`，调用方通过 `submit_response` 带外提交动作。等待有超时，超时返回 None。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::config::InteractionSection;
use crate::model::{UserInteractionEvent, UserInteractionResponse};

/// 用户对中断事件可选的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionAction {
    Continue,
    Modify,
    Pause,
    Abort,
    Other(String),
}

impl InteractionAction {
    pub fn parse(action: &str) -> Self {
        match action.trim().to_lowercase().replace('-', "_").as_str() {
            "continue" | "resume" => InteractionAction::Continue,
            "modify" | "modify_plan" => InteractionAction::Modify,
            "pause" => InteractionAction::Pause,
            "abort" | "cancel" => InteractionAction::Abort,
            other => InteractionAction::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InteractionAction::Continue => "continue",
            InteractionAction::Modify => "modify",
            InteractionAction::Pause => "pause",
            InteractionAction::Abort => "abort",
            InteractionAction::Other(s) => s,
        }
    }
}

/// 等待中的响应句柄
pub struct PendingResponse {
    pub event_id: String,
    rx: oneshot::Receiver<UserInteractionResponse>,
}

struct PendingEntry {
    event: UserInteractionEvent,
    tx: oneshot::Sender<UserInteractionResponse>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InteractionStats {
    pub pending_interactions: usize,
    pub tasks_with_pending_interactions: usize,
    pub interruption_requests: usize,
    pub responses_received: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    responses_received: u64,
    timeouts: u64,
}

/// 交互闸门
pub struct InteractionGate {
    allow_interruption: bool,
    default_timeout: Duration,
    interruptions: RwLock<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    counters: Mutex<Counters>,
}

impl InteractionGate {
    pub fn new(cfg: &InteractionSection) -> Self {
        Self {
            allow_interruption: cfg.allow_user_interruption,
            default_timeout: Duration::from_secs(cfg.user_response_timeout_secs),
            interruptions: RwLock::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn interruption_enabled(&self) -> bool {
        self.allow_interruption
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// 请求中断；中断被禁用时返回 false
    pub async fn request_interruption(&self, task_id: &str) -> bool {
        if !self.allow_interruption {
            return false;
        }
        self.interruptions.write().await.insert(task_id.to_string());
        tracing::info!(task_id = %task_id, "interruption requested");
        true
    }

    pub async fn check_interruption(&self, task_id: &str) -> bool {
        self.allow_interruption && self.interruptions.read().await.contains(task_id)
    }

    pub async fn clear_interruption(&self, task_id: &str) {
        self.interruptions.write().await.remove(task_id);
    }

    /// 创建交互事件；需要响应时登记等待句柄
    pub async fn open(
        &self,
        kind: &str,
        data: Value,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> (UserInteractionEvent, PendingResponse) {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let event = UserInteractionEvent {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            data,
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            response_required: true,
            timeout_secs: timeout.as_secs(),
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            event.id.clone(),
            PendingEntry {
                event: event.clone(),
                tx,
            },
        );
        tracing::info!(event_id = %event.id, kind = %kind, task_id = %task_id, "interaction event created");
        let handle = PendingResponse {
            event_id: event.id.clone(),
            rx,
        };
        (event, handle)
    }

    /// 等待响应；超时或事件被取消时返回 None，并清理登记
    pub async fn wait_for_response(
        &self,
        pending: PendingResponse,
        timeout: Option<Duration>,
    ) -> Option<UserInteractionResponse> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let PendingResponse { event_id, rx } = pending;
        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().await.remove(&event_id);
        match result {
            Ok(Ok(response)) => {
                tracing::info!(event_id = %event_id, action = %response.action, "user response received");
                Some(response)
            }
            Ok(Err(_)) => {
                tracing::info!(event_id = %event_id, "interaction cancelled");
                None
            }
            Err(_) => {
                self.counters.lock().await.timeouts += 1;
                tracing::warn!(event_id = %event_id, "timed out waiting for user response");
                None
            }
        }
    }

    /// 提交响应；未知 event_id 返回 false
    pub async fn submit_response(
        &self,
        event_id: &str,
        action: &str,
        data: Option<Map<String, Value>>,
    ) -> bool {
        let entry = match self.pending.lock().await.remove(event_id) {
            Some(e) => e,
            None => {
                tracing::warn!(event_id = %event_id, "response for unknown interaction event");
                return false;
            }
        };
        let response = UserInteractionResponse {
            event_id: event_id.to_string(),
            action: action.to_string(),
            data,
            timestamp: Utc::now(),
        };
        if entry.tx.send(response).is_err() {
            return false;
        }
        self.counters.lock().await.responses_received += 1;
        tracing::info!(event_id = %event_id, action = %action, "user response submitted");
        true
    }

    pub async fn pending_interactions(&self, task_id: Option<&str>) -> Vec<UserInteractionEvent> {
        self.pending
            .lock()
            .await
            .values()
            .filter(|e| task_id.map_or(true, |t| e.event.task_id == t))
            .map(|e| e.event.clone())
            .collect()
    }

    /// 取消交互事件，等待方随即得到 None
    pub async fn cancel_interaction(&self, event_id: &str) -> bool {
        let removed = self.pending.lock().await.remove(event_id).is_some();
        if removed {
            tracing::info!(event_id = %event_id, "interaction cancelled");
        }
        removed
    }

    /// 清理任务相关的交互与中断请求
    pub async fn cleanup_task(&self, task_id: &str) {
        let removed = {
            let mut pending = self.pending.lock().await;
            let before = pending.len();
            pending.retain(|_, e| e.event.task_id != task_id);
            before - pending.len()
        };
        self.clear_interruption(task_id).await;
        tracing::debug!(task_id = %task_id, removed, "task interactions cleaned up");
    }

    pub async fn statistics(&self) -> InteractionStats {
        let pending = self.pending.lock().await;
        let tasks: HashSet<&str> = pending.values().map(|e| e.event.task_id.as_str()).collect();
        let counters = self.counters.lock().await;
        InteractionStats {
            pending_interactions: pending.len(),
            tasks_with_pending_interactions: tasks.len(),
            interruption_requests: self.interruptions.read().await.len(),
            responses_received: counters.responses_received,
            timeouts: counters.timeouts,
        }
    }
}
