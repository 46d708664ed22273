//! 任务调度：Worker 并发池
//!
//! 所有分发共享一个 Semaphore。一次扇出按批取许可（最多 capacity 个），批内调用全部同时启动、
//! 互不等待；上限只约束不同 thread / 不同批次之间的并发。许可在整批结束（含超时）时释放。

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// 任务调度器
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    /// Worker 并发限制（默认 8）
    worker_semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_workers: usize) -> Self {
        let capacity = max_concurrent_workers.max(1);
        Self {
            worker_semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 获取单个 worker 执行许可；只有 close() 之后才会失败
    pub async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.acquire_batch(1).await
    }

    /// 为一批 n 个调用取许可，数量截断到 capacity，批内调用不再逐个排队
    pub async fn acquire_batch(&self, n: usize) -> Result<OwnedSemaphorePermit, AcquireError> {
        let permits = n.clamp(1, self.capacity) as u32;
        self.worker_semaphore.clone().acquire_many_owned(permits).await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.worker_semaphore.available_permits()
    }

    /// 关闭后新的 acquire 立即失败（关停时使用）
    pub fn close(&self) {
        self.worker_semaphore.close();
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_returned() {
        let scheduler = TaskScheduler::new(2);
        let a = scheduler.acquire_worker().await.unwrap();
        let _b = scheduler.acquire_worker().await.unwrap();
        assert_eq!(scheduler.available(), 0);
        drop(a);
        assert_eq!(scheduler.available(), 1);
    }

    #[tokio::test]
    async fn test_batch_larger_than_capacity_is_clamped() {
        let scheduler = TaskScheduler::new(2);
        let batch = scheduler.acquire_batch(5).await.unwrap();
        assert_eq!(batch.num_permits(), 2);
        assert_eq!(scheduler.available(), 0);
        drop(batch);
        assert_eq!(scheduler.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let scheduler = TaskScheduler::new(0);
        assert_eq!(scheduler.capacity(), 1);
    }

    #[tokio::test]
    async fn test_closed_scheduler_rejects() {
        let scheduler = TaskScheduler::new(1);
        scheduler.close();
        assert!(scheduler.acquire_worker().await.is_err());
    }
}
