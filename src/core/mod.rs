//! 核心层：错误分类与恢复、worker 并发池、运行时组装、优雅关闭

pub mod builder;
pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod task_scheduler;

pub use builder::{Runtime, RuntimeBuilder};
pub use error::{HiveError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    CleanupOutcome, SchedulerCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, WorkerPoolCleanup,
};
pub use task_scheduler::TaskScheduler;
