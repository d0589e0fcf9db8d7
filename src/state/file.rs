//! 文件后端：`<dir>/tasks/<task_id>.json`，每个任务一份格式化 JSON
//!
//! 写入先落到同目录临时文件再 rename，同一任务的写入由按 id 的锁串行化。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::KeyedLocks;
use crate::model::{Task, TaskStatus};
use crate::state::{StateError, StateStore};

pub struct FileStateStore {
    tasks_dir: PathBuf,
    locks: KeyedLocks,
}

impl FileStateStore {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, StateError> {
        let tasks_dir = dir.as_ref().join("tasks");
        tokio::fs::create_dir_all(&tasks_dir).await?;
        tracing::info!(dir = %tasks_dir.display(), "file state store initialized");
        Ok(Self {
            tasks_dir,
            locks: KeyedLocks::new(),
        })
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{}.json", sanitize(task_id)))
    }

    async fn read_task(path: &Path) -> Result<Option<Task>, StateError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let task: Task = serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
            id: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            reason: e.to_string(),
        })?;
        Ok(Some(task))
    }
}

/// id 只保留安全字符，避免路径穿越
fn sanitize(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, task: &Task) -> Result<(), StateError> {
        let _guard = self.locks.lock(&task.id).await;
        let path = self.path_for(&task.id);
        let tmp = self
            .tasks_dir
            .join(format!(".{}.{}.tmp", sanitize(&task.id), Uuid::new_v4().simple()));
        let body = serde_json::to_vec_pretty(task)?;
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(task_id = %task.id, "task state saved");
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<Task>, StateError> {
        let _guard = self.locks.lock(task_id).await;
        Self::read_task(&self.path_for(task_id)).await
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StateError> {
        let _guard = self.locks.lock(task_id).await;
        match tokio::fs::remove_file(self.path_for(task_id)).await {
            Ok(()) => {
                tracing::info!(task_id = %task_id, "task state deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StateError> {
        let pattern = self.tasks_dir.join("*.json");
        let paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(Result::ok)
            .collect();

        let mut found = Vec::new();
        for path in paths {
            match Self::read_task(&path).await {
                Ok(Some(task)) => {
                    if status.map_or(true, |s| task.status == s) {
                        found.push((task.created_at, task.id));
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task record"),
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        let ids = found.into_iter().map(|(_, id)| id);
        Ok(match limit {
            Some(n) => ids.take(n).collect(),
            None => ids.collect(),
        })
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
