//! StateManager：内存缓存 + 脏集合 + 周期刷盘
//!
//! 任务每次状态变化只标脏；后台循环按间隔把脏任务写入后端，完成/取消时强制同步写入，
//! 关闭时先停循环再把剩余脏任务全部刷盘。写入失败的任务重新标脏，下一轮再试。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::KeyedLocks;
use crate::model::{Task, TaskStatus};
use crate::state::{StateError, StateStore};

/// resume 前的诊断信息
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryInfo {
    pub task_id: String,
    pub current_status: TaskStatus,
    pub progress: f64,
    pub can_resume: bool,
    pub pending_todos: usize,
    pub in_progress_todos: usize,
    pub failed_todos: usize,
    pub last_update: DateTime<Utc>,
    pub suggestions: Vec<String>,
}

struct FlushLoop {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

pub struct StateManager {
    store: Arc<dyn StateStore>,
    cache: RwLock<HashMap<String, Task>>,
    dirty: Mutex<HashSet<String>>,
    write_locks: KeyedLocks,
    flush_interval: Duration,
    flush_loop: Mutex<Option<FlushLoop>>,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            write_locks: KeyedLocks::new(),
            flush_interval: Duration::from_secs(30),
            flush_loop: Mutex::new(None),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// 更新缓存并标脏
    pub async fn put(&self, task: Task) {
        let id = task.id.clone();
        self.cache.write().await.insert(id.clone(), task);
        self.dirty.lock().await.insert(id);
    }

    /// 更新缓存；force 时立即同步写入后端
    pub async fn save(&self, task: &Task, force: bool) -> Result<(), StateError> {
        if !force {
            self.put(task.clone()).await;
            return Ok(());
        }
        self.cache.write().await.insert(task.id.clone(), task.clone());
        let _guard = self.write_locks.lock(&task.id).await;
        self.dirty.lock().await.remove(&task.id);
        if let Err(e) = self.store.save(task).await {
            self.dirty.lock().await.insert(task.id.clone());
            return Err(e);
        }
        Ok(())
    }

    /// 先查缓存，未命中再从后端加载
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, StateError> {
        if let Some(task) = self.cache.read().await.get(task_id) {
            return Ok(Some(task.clone()));
        }
        let loaded = self.store.load(task_id).await?;
        if let Some(task) = &loaded {
            self.cache
                .write()
                .await
                .entry(task_id.to_string())
                .or_insert_with(|| task.clone());
        }
        Ok(loaded)
    }

    pub async fn delete(&self, task_id: &str) -> Result<bool, StateError> {
        let _guard = self.write_locks.lock(task_id).await;
        let cached = self.cache.write().await.remove(task_id).is_some();
        self.dirty.lock().await.remove(task_id);
        let stored = self.store.delete(task_id).await?;
        Ok(cached || stored)
    }

    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StateError> {
        self.store.list(status, limit).await
    }

    /// 从缓存移除已落盘的任务；仍为脏时不移除
    pub async fn evict(&self, task_id: &str) -> bool {
        if self.dirty.lock().await.contains(task_id) {
            return false;
        }
        self.cache.write().await.remove(task_id).is_some()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.lock().await.len()
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// 写出所有脏任务，返回成功写入数；失败的重新标脏并返回第一个错误
    pub async fn flush(&self) -> Result<usize, StateError> {
        let ids: Vec<String> = self.dirty.lock().await.drain().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut saved = 0;
        let mut first_err = None;
        for id in ids {
            let _guard = self.write_locks.lock(&id).await;
            // 取锁后再读缓存，保证写入的是最新版本
            let Some(task) = self.cache.read().await.get(&id).cloned() else {
                continue;
            };
            match self.store.save(&task).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "failed to flush task state");
                    self.dirty.lock().await.insert(id);
                    first_err.get_or_insert(e);
                }
            }
        }
        self.write_locks.prune().await;

        if saved > 0 {
            tracing::debug!(saved, backend = self.store.name(), "flushed dirty tasks");
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    /// 启动后台刷盘循环；重复调用无效
    pub async fn start_auto_flush(self: &Arc<Self>) {
        let mut slot = self.flush_loop.lock().await;
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let manager = Arc::clone(self);
        let loop_token = token.clone();
        let interval = self.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.flush().await {
                            tracing::warn!(error = %e, "auto flush incomplete, will retry");
                        }
                    }
                }
            }
        });
        *slot = Some(FlushLoop { handle, token });
        tracing::info!(interval_secs = interval.as_secs(), "state auto flush started");
    }

    /// 停止后台循环并等待其退出
    pub async fn stop_auto_flush(&self) {
        let running = self.flush_loop.lock().await.take();
        if let Some(FlushLoop { handle, token }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "state flush loop ended abnormally");
            }
        }
    }

    /// 停循环并刷出所有脏任务
    pub async fn shutdown(&self) -> Result<usize, StateError> {
        self.stop_auto_flush().await;
        self.flush().await
    }

    pub async fn recovery_info(&self, task_id: &str) -> Result<Option<RecoveryInfo>, StateError> {
        let Some(task) = self.get(task_id).await? else {
            return Ok(None);
        };
        let failed = task.failed_todos().len();
        let mut suggestions = Vec::new();
        match task.status {
            TaskStatus::InProgress => {
                suggestions.push("Task was interrupted mid-run and can be resumed".to_string());
                if failed > 0 {
                    suggestions.push(format!(
                        "{failed} step(s) failed, check their failure reasons before resuming"
                    ));
                }
            }
            TaskStatus::Pending => {
                suggestions.push("Task has not started yet and can be resumed".to_string())
            }
            TaskStatus::Failed => suggestions
                .push("Task failed, inspect the failed steps and resubmit".to_string()),
            TaskStatus::Completed => {
                suggestions.push("Task already completed, nothing to resume".to_string())
            }
            TaskStatus::Cancelled => {
                suggestions.push("Task was cancelled and cannot be resumed".to_string())
            }
        }

        Ok(Some(RecoveryInfo {
            task_id: task.id.clone(),
            current_status: task.status,
            progress: task.progress_percentage(),
            can_resume: task.is_resumable(),
            pending_todos: task.pending_todos().len(),
            in_progress_todos: task.in_progress_todos().len(),
            failed_todos: failed,
            last_update: task
                .completed_at
                .or(task.started_at)
                .unwrap_or(task.created_at),
            suggestions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> (Arc<StateManager>, Arc<FileStateStore>) {
        let store = Arc::new(FileStateStore::new(dir.path()).await.unwrap());
        (Arc::new(StateManager::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_put_then_flush() {
        let dir = TempDir::new().unwrap();
        let (mgr, store) = manager(&dir).await;
        let task = Task::new("q");
        mgr.put(task.clone()).await;
        assert_eq!(mgr.dirty_count().await, 1);
        assert!(store.load(&task.id).await.unwrap().is_none());

        assert_eq!(mgr.flush().await.unwrap(), 1);
        assert_eq!(mgr.dirty_count().await, 0);
        assert_eq!(store.load(&task.id).await.unwrap().unwrap(), task);
    }

    #[tokio::test]
    async fn test_forced_save_is_immediate() {
        let dir = TempDir::new().unwrap();
        let (mgr, store) = manager(&dir).await;
        let task = Task::new("q");
        mgr.save(&task, true).await.unwrap();
        assert!(store.load(&task.id).await.unwrap().is_some());
        assert_eq!(mgr.dirty_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_store() {
        let dir = TempDir::new().unwrap();
        let (mgr, store) = manager(&dir).await;
        let task = Task::new("q");
        store.save(&task).await.unwrap();
        assert_eq!(mgr.get(&task.id).await.unwrap().unwrap(), task);
        assert_eq!(mgr.cached_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_flush_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()).await.unwrap());
        let mgr = Arc::new(
            StateManager::new(store.clone()).with_flush_interval(Duration::from_secs(30)),
        );
        mgr.start_auto_flush().await;

        let a = Task::new("a");
        mgr.put(a.clone()).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(mgr.dirty_count().await, 0);

        let b = Task::new("b");
        mgr.put(b.clone()).await;
        assert_eq!(mgr.shutdown().await.unwrap(), 1);
        assert!(store.load(&b.id).await.unwrap().is_some());
    }

    struct FlakyStore {
        fail: AtomicBool,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn save(&self, _task: &Task) -> Result<(), StateError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StateError::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        }
        async fn load(&self, _task_id: &str) -> Result<Option<Task>, StateError> {
            Ok(None)
        }
        async fn delete(&self, _task_id: &str) -> Result<bool, StateError> {
            Ok(false)
        }
        async fn list(
            &self,
            _status: Option<TaskStatus>,
            _limit: Option<usize>,
        ) -> Result<Vec<String>, StateError> {
            Ok(vec![])
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_flush_re_marks_dirty() {
        let store = Arc::new(FlakyStore {
            fail: AtomicBool::new(true),
        });
        let mgr = StateManager::new(store.clone());
        mgr.put(Task::new("q")).await;
        assert!(mgr.flush().await.is_err());
        assert_eq!(mgr.dirty_count().await, 1);

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(mgr.flush().await.unwrap(), 1);
        assert_eq!(mgr.dirty_count().await, 0);
    }

    #[tokio::test]
    async fn test_recovery_info() {
        let dir = TempDir::new().unwrap();
        let (mgr, _) = manager(&dir).await;
        let mut task = Task::new("q");
        task.todo_list = vec![crate::model::TodoItem::new("a"), crate::model::TodoItem::new("b")];
        task.todo_list[0].mark_started().unwrap();
        task.todo_list[0].mark_completed().unwrap();
        task.update_status();
        mgr.put(task.clone()).await;

        let info = mgr.recovery_info(&task.id).await.unwrap().unwrap();
        assert!(info.can_resume);
        assert_eq!(info.pending_todos, 1);
        assert_eq!(info.progress, 50.0);
        assert!(mgr.recovery_info("missing").await.unwrap().is_none());
    }
}
