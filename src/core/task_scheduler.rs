//! 工具并发许可
//!
//! 进程级 Semaphore 限制所有任务同时在途的工具调用数；Parallel 批次里的每个调用各自取一个许可。
//! 许可随 OwnedSemaphorePermit 释放，成功、出错或被取消的路径都会归还。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::EngineError;

/// 工具调度器
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    max_concurrent_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let max = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max)),
            max_concurrent_tools: max,
        }
    }

    /// 获取工具执行许可；关闭后返回 Shutdown
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, EngineError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }

    /// 当前在途调用数
    pub fn in_flight(&self) -> usize {
        self.max_concurrent_tools
            .saturating_sub(self.tool_semaphore.available_permits())
    }

    /// 关闭许可池，等待中的 acquire 立即返回错误
    pub fn close(&self) {
        self.tool_semaphore.close();
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(10)
    }
}
