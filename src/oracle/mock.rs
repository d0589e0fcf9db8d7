//! 脚本化判定器客户端（测试与演示用）
//!
//! 按顺序返回预先写好的回复，并记录每次调用的 (system, prompt)；脚本用完后返回 Unavailable。

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::oracle::{OracleClient, OracleError};

pub struct ScriptedOracleClient {
    replies: Mutex<VecDeque<Result<String, OracleError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedOracleClient {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::<String>::new())
    }

    pub async fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().await.push_back(Ok(reply.into()));
    }

    pub async fn push_error(&self, error: OracleError) {
        self.replies.lock().await.push_back(Err(error));
    }

    /// 已发生的调用 (system, prompt)
    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.replies.lock().await.len()
    }
}

#[async_trait]
impl OracleClient for ScriptedOracleClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, OracleError> {
        self.calls
            .lock()
            .await
            .push((system.to_string(), prompt.to_string()));
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::Unavailable("no scripted reply left".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_then_unavailable() {
        let client = ScriptedOracleClient::new(["first"]);
        client.push_error(OracleError::Timeout).await;
        assert_eq!(client.complete("s", "p1").await.unwrap(), "first");
        assert!(matches!(client.complete("s", "p2").await, Err(OracleError::Timeout)));
        assert!(matches!(
            client.complete("s", "p3").await,
            Err(OracleError::Unavailable(_))
        ));
        assert_eq!(client.calls().await.len(), 3);
        assert_eq!(client.remaining().await, 0);
    }
}
