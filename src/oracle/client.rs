//! 文本判定器客户端抽象
//!
//! 任何能把 (system, prompt) 变成一段文本的后端都实现 OracleClient；适配层负责解析与兜底。

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle timed out")]
    Timeout,

    #[error("Malformed oracle reply: {0}")]
    Malformed(String),
}

/// 文本判定器：非流式完成
#[async_trait]
pub trait OracleClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, OracleError>;

    /// 日志里使用的名字
    fn name(&self) -> &str {
        "oracle"
    }
}
