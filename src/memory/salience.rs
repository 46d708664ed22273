//! 显著性评分
//!
//! score = α·similarity + β·ln(1+mention_count) + γ·e^(-age_hours/τ) + δ·Σ(flag.score + locked_bonus)
//! 其中 locked_bonus 只加在 locked 的 flag 上。评分是派生值，从不参与去重与匹配。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{MemoryFlag, MemoryRecord};

/// 评分常量（默认值即规范值，改动会破坏数值一致性）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// 语义相似度权重
    pub alpha: f64,
    /// 提及次数权重
    pub beta: f64,
    /// 近因衰减权重
    pub gamma: f64,
    /// 用户 flag 权重
    pub delta: f64,
    /// 衰减时间常数（小时）
    pub tau_hours: f64,
    pub locked_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.7,
            gamma: 0.5,
            delta: 2.0,
            tau_hours: 72.0,
            locked_bonus: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SalienceScorer {
    weights: ScoringWeights,
}

impl SalienceScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn score(&self, record: &MemoryRecord, similarity: f64) -> f64 {
        self.score_at(record, similarity, Utc::now())
    }

    pub fn score_at(&self, record: &MemoryRecord, similarity: f64, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - record.age_reference()).num_milliseconds().max(0);
        let age_hours = age_ms as f64 / 3_600_000.0;
        self.score_parts(similarity, record.mention_count, age_hours, &record.flags)
    }

    pub fn score_parts(
        &self,
        similarity: f64,
        mention_count: u32,
        age_hours: f64,
        flags: &[MemoryFlag],
    ) -> f64 {
        let w = &self.weights;
        let count_term = w.beta * (mention_count as f64).ln_1p();
        let recent_term = if w.tau_hours > 0.0 {
            w.gamma * (-age_hours.max(0.0) / w.tau_hours).exp()
        } else {
            0.0
        };
        let flag_term = w.delta
            * flags
                .iter()
                .map(|f| f.score + if f.locked { w.locked_bonus } else { 0.0 })
                .sum::<f64>();
        w.alpha * similarity + count_term + recent_term + flag_term
    }
}
