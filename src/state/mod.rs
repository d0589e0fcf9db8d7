//! 任务状态持久化：后端抽象、文件与 SQLite 两种实现、带缓存与周期刷盘的 StateManager

pub mod file;
pub mod manager;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

pub use file::FileStateStore;
pub use manager::{RecoveryInfo, StateManager};
pub use sqlite::SqliteStateStore;
pub use store::{StateError, StateStore};

use crate::config::{StateBackend, StateSection};

/// 按配置创建后端
pub async fn open_store(cfg: &StateSection) -> Result<Arc<dyn StateStore>, StateError> {
    Ok(match cfg.backend {
        StateBackend::File => Arc::new(FileStateStore::new(&cfg.dir).await?),
        StateBackend::Sqlite => Arc::new(SqliteStateStore::open(&cfg.db_path)?),
    })
}
