//! 按 key 的异步锁（工具名 / 任务 id）
//!
//! 不同 key 之间互不阻塞；同一 key 的写入串行化。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 key 对应的锁，持有到 guard 释放
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 丢弃无人持有的锁条目
    pub async fn prune(&self) {
        self.locks
            .lock()
            .await
            .retain(|_, l| Arc::strong_count(l) > 1);
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
