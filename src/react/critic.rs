//! Critic：Review 阶段的判定
//!
//! 规划阶段已宣告完成时直接放行；否则交给 RouteClassifier，并把 Act 阶段记下的 worker 失败
//! 与分类器反馈合并，作为下一轮规划的 feedback。

use std::sync::Arc;

use crate::llm::ProviderError;
use crate::react::{Route, RouteClassifier, RouteDecision};
use crate::workflow::WorkflowState;

pub struct Critic {
    classifier: Arc<dyn RouteClassifier>,
}

impl Critic {
    pub fn new(classifier: Arc<dyn RouteClassifier>) -> Self {
        Self { classifier }
    }

    pub async fn review(&self, state: &WorkflowState) -> Result<RouteDecision, ProviderError> {
        if state.task_complete {
            return Ok(RouteDecision::complete(state.summary.clone()));
        }
        let mut decision = self.classifier.classify(state).await?;
        if decision.route == Route::Continue {
            decision.feedback =
                merge_feedback(state.feedback.as_deref(), decision.feedback.as_deref());
        }
        Ok(decision)
    }
}

fn merge_feedback(observed: Option<&str>, reviewer: Option<&str>) -> Option<String> {
    match (observed, reviewer) {
        (Some(a), Some(b)) if a != b => Some(format!("{a}\n{b}")),
        (Some(a), _) => Some(a.to_string()),
        (None, b) => b.map(str::to_string),
    }
}
