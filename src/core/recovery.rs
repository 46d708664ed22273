//! 错误恢复引擎
//!
//! 根据 HiveError 类型返回 RecoveryAction，供工作流引擎决定是退避重试、回填 feedback 还是终止。

use crate::core::{HiveError, RecoveryAction};

/// 诊断原因：重试耗尽
pub const REASON_RETRIES_EXHAUSTED: &str = "provider_retries_exhausted";
/// 诊断原因：checkpoint 版本冲突
pub const REASON_STATE_CONFLICT: &str = "state_conflict";

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RecoveryEngine {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// attempt 为已经失败的次数（首次失败传 1）
    pub fn handle(&self, err: &HiveError, attempt: u32) -> RecoveryAction {
        match err {
            HiveError::TransientProvider(_) if attempt <= self.max_retries => {
                RecoveryAction::RetryWithBackoff
            }
            HiveError::TransientProvider(_) => {
                RecoveryAction::Terminate(REASON_RETRIES_EXHAUSTED.to_string())
            }
            HiveError::Validation(msg) => {
                RecoveryAction::FeedBack(format!("invalid worker input: {msg}"))
            }
            HiveError::ToolExecution { worker, message } => {
                RecoveryAction::FeedBack(format!("worker '{worker}' failed: {message}"))
            }
            HiveError::Curation(_) => RecoveryAction::LogAndContinue,
            HiveError::StateConflict { .. } => {
                RecoveryAction::Terminate(REASON_STATE_CONFLICT.to_string())
            }
            HiveError::Cancelled => RecoveryAction::Terminate("cancelled".to_string()),
            HiveError::Checkpoint(_) => RecoveryAction::Terminate("checkpoint_failure".to_string()),
            HiveError::Config(_) | HiveError::ThreadNotFound(_) => {
                RecoveryAction::Terminate("invalid_request".to_string())
            }
        }
    }
}
