//! 优雅关闭
//!
//! ShutdownManager 持有全局取消 token：工作流在下一个挂起点观察到取消并停在最近的 checkpoint 上，
//! 之后由 ShutdownCoordinator 依次执行清理（停止整理调度器、关闭 worker 池）。
//! 每个清理带超时，单个失败或超时不影响其它清理。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::TaskScheduler;
use crate::memory::ReflectionScheduler;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 请求处理完毕
    Completed,
    FatalError(String),
}

/// 关闭信号管理器；只记录第一次关闭的原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 工作流 run_with_cancel 使用的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；返回是否为第一次触发
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            tracing::debug!(?reason, "shutdown already requested");
            return false;
        }
        tracing::info!(?reason, "shutdown requested");
        *slot = Some(reason);
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 监听 Ctrl+C 与 SIGTERM（unix），收到任一信号即触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = manager.token.cancelled() => return,
                r = tokio::signal::ctrl_c() => match r {
                    Ok(()) => ShutdownReason::UserInitiated,
                    Err(e) => {
                        tracing::warn!("ctrl-c handler unavailable: {}", e);
                        return;
                    }
                },
                _ = terminate() => ShutdownReason::Signal,
            };
            manager.shutdown(reason);
        });
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// 关闭时执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 单个清理的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CleanupOutcome {
    Done,
    Failed(String),
    TimedOut,
}

/// 按注册顺序执行清理
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanups: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanups: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&mut self, cleanup: impl ShutdownCleanup + 'static) {
        self.cleanups.push(Arc::new(cleanup));
    }

    pub async fn run_cleanup(&self) -> Vec<(&'static str, CleanupOutcome)> {
        tracing::info!(
            reason = ?self.manager.reason(),
            cleanups = self.cleanups.len(),
            "running shutdown cleanup"
        );
        let mut outcomes = Vec::with_capacity(self.cleanups.len());
        for cleanup in &self.cleanups {
            let name = cleanup.name();
            let outcome = match tokio::time::timeout(self.timeout, cleanup.cleanup()).await {
                Ok(Ok(())) => CleanupOutcome::Done,
                Ok(Err(e)) => {
                    tracing::warn!(cleanup = name, "cleanup failed: {:#}", e);
                    CleanupOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(
                        cleanup = name,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "cleanup timed out"
                    );
                    CleanupOutcome::TimedOut
                }
            };
            outcomes.push((name, outcome));
        }
        outcomes
    }
}

/// 停止整理计时器并等待进行中的整理
pub struct SchedulerCleanup {
    scheduler: Arc<ReflectionScheduler>,
}

impl SchedulerCleanup {
    pub fn new(scheduler: Arc<ReflectionScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SchedulerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "reflection_scheduler"
    }
}

/// 关闭 worker 池：之后的分发立即以 "dispatcher closed" 失败
pub struct WorkerPoolCleanup {
    pool: TaskScheduler,
}

impl WorkerPoolCleanup {
    pub fn new(pool: TaskScheduler) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WorkerPoolCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.pool.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "worker_pool"
    }
}
