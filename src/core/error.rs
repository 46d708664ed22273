//! 运行时错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 HiveError 决定 RetryWithBackoff / FeedBack / LogAndContinue / Terminate。

use thiserror::Error;

use crate::llm::ProviderError;
use crate::memory::CurationError;
use crate::tools::DispatchError;
use crate::workflow::CheckpointError;

/// 监督循环运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HiveError {
    /// Worker 输入不符合其 schema：立即失败，永不重试
    #[error("Validation error: {0}")]
    Validation(String),

    /// 生成/相似度提供方超时或限流：按退避策略重试
    #[error("Transient provider error: {0}")]
    TransientProvider(#[from] ProviderError),

    /// Worker 自身报告失败：写入 feedback，驱动重新规划
    #[error("Tool execution failed: {worker}: {message}")]
    ToolExecution { worker: String, message: String },

    /// Checkpoint CAS 失败：致命，需要人工介入，绝不静默覆盖
    #[error("State conflict on thread {thread_id}: expected version {expected}, found {actual}")]
    StateConflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    /// 记忆整理失败：按命名空间回滚，记录日志后调度器继续运行
    #[error("Curation failed: {0}")]
    Curation(#[from] CurationError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Workflow cancelled")]
    Cancelled,
}

impl From<CheckpointError> for HiveError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Conflict {
                thread_id,
                expected,
                actual,
            } => HiveError::StateConflict {
                thread_id,
                expected,
                actual,
            },
            other => HiveError::Checkpoint(other.to_string()),
        }
    }
}

impl From<DispatchError> for HiveError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation { .. } => HiveError::Validation(err.to_string()),
            DispatchError::Failed { worker, message } => {
                HiveError::ToolExecution { worker, message }
            }
            other => HiveError::ToolExecution {
                worker: other.worker().to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待退避时间后重试同一步骤
    RetryWithBackoff,
    /// 不中断流程，把错误描述作为下一轮 Plan 的 feedback
    FeedBack(String),
    /// 记录日志后继续（后台任务）
    LogAndContinue,
    /// 终止当前工作流实例，附带诊断原因
    Terminate(String),
}
