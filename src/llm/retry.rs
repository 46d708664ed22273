//! 指数退避策略
//!
//! 第 n 次失败后的等待时间为 backoff_base_ms * 2^(n-1)，上限 max_backoff_ms；
//! RateLimited 携带 retry_after 时取两者较大值。

use std::time::Duration;

use crate::llm::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 200,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_base_ms,
            ..Self::default()
        }
    }

    /// attempt 从 1 开始
    pub fn delay_for(&self, attempt: u32, err: Option<&ProviderError>) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let backoff = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let hinted = match err {
            Some(ProviderError::RateLimited {
                retry_after_ms: Some(ms),
            }) => *ms,
            _ => 0,
        };
        Duration::from_millis(backoff.max(hinted))
    }
}
