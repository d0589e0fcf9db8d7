//! SQLite 后端：tasks 表一行一个任务，嵌套结构以 JSON 文本列保存
//!
//! rusqlite 连接是同步的，所有访问都经 `spawn_blocking`；写入在事务中 `INSERT OR REPLACE`。
//! 文件库打开一组 WAL 连接，按任务 id 哈希选连接：同一任务的读写串行，不同任务互不阻塞。
//! 跨连接的写冲突由 busy_timeout 等待。内存库无法跨连接共享，只用一个连接。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Task, TaskStatus};
use crate::state::{StateError, StateStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    complexity_data TEXT,
    todo_list_data TEXT NOT NULL,
    metadata_data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
";

/// 文件库的连接数
const POOL_SIZE: usize = 4;

#[derive(Clone)]
pub struct SqliteStateStore {
    conns: Arc<Vec<Arc<Mutex<Connection>>>>,
    next: Arc<AtomicUsize>,
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let mut conns = Vec::with_capacity(POOL_SIZE);
        for i in 0..POOL_SIZE {
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA busy_timeout=5000;",
            )?;
            if i == 0 {
                conn.execute_batch(SCHEMA)?;
            }
            conns.push(Arc::new(Mutex::new(conn)));
        }
        tracing::info!(path = %path.display(), connections = POOL_SIZE, "sqlite state store initialized");
        Ok(Self::from_connections(conns))
    }

    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connections(vec![Arc::new(Mutex::new(conn))]))
    }

    fn from_connections(conns: Vec<Arc<Mutex<Connection>>>) -> Self {
        Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// 任务 id 固定映射到一个连接
    fn shard_for(&self, task_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        task_id.hash(&mut hasher);
        (hasher.finish() % self.conns.len() as u64) as usize
    }

    /// 在阻塞线程池中独占一个连接执行 f；key 为 None 时轮询取连接
    async fn with_conn<F, T>(&self, key: Option<&str>, f: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StateError> + Send + 'static,
        T: Send + 'static,
    {
        let idx = match key {
            Some(id) => self.shard_for(id),
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len(),
        };
        let conn = self.conns[idx].clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StateError::Join("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StateError::Join(e.to_string()))?
    }
}

struct TaskRow {
    id: String,
    query: String,
    description: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    complexity_data: Option<String>,
    todo_list_data: String,
    metadata_data: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StateError> {
        let corrupt = |reason: String| StateError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let complexity = match &self.complexity_data {
            Some(raw) => Some(serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?),
            None => None,
        };
        let todo_list =
            serde_json::from_str(&self.todo_list_data).map_err(|e| corrupt(e.to_string()))?;
        let metadata =
            serde_json::from_str(&self.metadata_data).map_err(|e| corrupt(e.to_string()))?;
        Ok(Task {
            id: self.id,
            query: self.query,
            description: self.description.unwrap_or_default(),
            complexity,
            todo_list,
            status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            metadata,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save(&self, task: &Task) -> Result<(), StateError> {
        let complexity = task
            .complexity
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let todos = serde_json::to_string(&task.todo_list)?;
        let metadata = serde_json::to_string(&task.metadata)?;
        let task = task.clone();
        let task_id = task.id.clone();

        self.with_conn(Some(task_id.as_str()), move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO tasks
                 (id, query, description, status, created_at, started_at, completed_at,
                  complexity_data, todo_list_data, metadata_data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id,
                    task.query,
                    task.description,
                    task.status.as_str(),
                    task.created_at,
                    task.started_at,
                    task.completed_at,
                    complexity,
                    todos,
                    metadata,
                    Utc::now(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        tracing::debug!(task_id = %task_id, "task state saved (sqlite)");
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<Task>, StateError> {
        let id = task_id.to_string();
        let row = self
            .with_conn(Some(task_id), move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, query, description, status, created_at, started_at, completed_at,
                                complexity_data, todo_list_data, metadata_data
                         FROM tasks WHERE id = ?1",
                        params![id],
                        |r| {
                            Ok(TaskRow {
                                id: r.get(0)?,
                                query: r.get(1)?,
                                description: r.get(2)?,
                                status: r.get(3)?,
                                created_at: r.get(4)?,
                                started_at: r.get(5)?,
                                completed_at: r.get(6)?,
                                complexity_data: r.get(7)?,
                                todo_list_data: r.get(8)?,
                                metadata_data: r.get(9)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StateError> {
        let id = task_id.to_string();
        let n = self
            .with_conn(Some(task_id), move |conn| {
                Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?)
            })
            .await?;
        Ok(n > 0)
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StateError> {
        self.with_conn(None, move |conn| {
            // LIMIT -1 表示不限
            let limit = limit.map_or(-1, |n| n as i64);
            let ids = match status {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT id FROM tasks WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![s.as_str(), limit], |r| r.get(0))?;
                    let ids = rows.collect::<Result<Vec<String>, _>>()?;
                    ids
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT id FROM tasks ORDER BY created_at DESC LIMIT ?1")?;
                    let rows = stmt.query_map(params![limit], |r| r.get(0))?;
                    let ids = rows.collect::<Result<Vec<String>, _>>()?;
                    ids
                }
            };
            Ok(ids)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Complexity, TodoItem};

    fn sample_task(query: &str) -> Task {
        let mut task = Task::new(query);
        task.complexity = Some(Complexity::conservative_default());
        let mut a = TodoItem::new("read input").with_tools(["file_read"]).with_priority(3);
        a.mark_started().unwrap();
        a.mark_failed("timeout").unwrap();
        a.reset_for_retry().unwrap();
        task.todo_list = vec![a, TodoItem::new("write output")];
        task.metadata.insert("n".into(), serde_json::json!(1));
        task.mark_started();
        task
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let task = sample_task("q");
        store.save(&task).await.unwrap();
        let loaded = store.load(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn test_replace_delete_and_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStateStore::open(dir.path().join("state.db")).unwrap();
        let mut a = sample_task("a");
        let b = sample_task("b");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        a.cancel();
        store.save(&a).await.unwrap();
        assert_eq!(
            store.list(Some(TaskStatus::Cancelled), None).await.unwrap(),
            vec![a.id.clone()]
        );
        assert_eq!(store.list(None, None).await.unwrap().len(), 2);
        assert_eq!(store.list(None, Some(1)).await.unwrap().len(), 1);

        assert!(store.delete(&a.id).await.unwrap());
        assert!(!store.delete(&a.id).await.unwrap());
        assert!(store.load(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connections_are_sharded_by_task_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStateStore::open(dir.path().join("state.db")).unwrap();
        assert_eq!(store.connection_count(), POOL_SIZE);
        assert_eq!(store.shard_for("task-a"), store.shard_for("task-a"));
        let shards: std::collections::HashSet<usize> =
            (0..32).map(|i| store.shard_for(&format!("task-{i}"))).collect();
        assert!(shards.len() > 1);

        // 并发写入不同任务，跨连接提交
        let tasks: Vec<Task> = (0..16).map(|i| sample_task(&format!("q{i}"))).collect();
        let saves = tasks.iter().map(|t| store.save(t));
        for result in futures_util::future::join_all(saves).await {
            result.unwrap();
        }
        assert_eq!(store.list(None, None).await.unwrap().len(), 16);
        for t in &tasks {
            assert_eq!(store.load(&t.id).await.unwrap().unwrap().query, t.query);
        }

        assert_eq!(SqliteStateStore::open_in_memory().unwrap().connection_count(), 1);
    }
}
