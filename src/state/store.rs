//! 任务状态存储抽象
//!
//! TaskEngine 只依赖 `StateStore`，文件与 SQLite 两种后端可以互换。

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Task, TaskStatus};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Corrupt record for task {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Background task failed: {0}")]
    Join(String),
}

/// 持久化后端
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 原子写入：崩溃不会破坏上一次成功写入的快照
    async fn save(&self, task: &Task) -> Result<(), StateError>;

    async fn load(&self, task_id: &str) -> Result<Option<Task>, StateError>;

    /// 删除记录；不存在时返回 false
    async fn delete(&self, task_id: &str) -> Result<bool, StateError>;

    /// 按状态过滤，最新创建的在前
    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StateError>;

    fn name(&self) -> &'static str;
}
