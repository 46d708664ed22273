//! Review 路由：把「是否完成」的判断封装为返回封闭枚举的分类器，便于脱离生成模型单测

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{GenerationProvider, ProviderError};
use crate::tools::schema::{preview, schema_value};
use crate::workflow::{ToolResult, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Complete,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub route: Route,
    /// 完成时写入情景记忆的总结
    pub summary: Option<String>,
    /// 继续时交给下一轮规划的反馈
    pub feedback: Option<String>,
}

impl RouteDecision {
    pub fn complete(summary: Option<String>) -> Self {
        Self {
            route: Route::Complete,
            summary,
            feedback: None,
        }
    }

    pub fn proceed(feedback: Option<String>) -> Self {
        Self {
            route: Route::Continue,
            summary: None,
            feedback,
        }
    }
}

#[async_trait]
pub trait RouteClassifier: Send + Sync {
    async fn classify(&self, state: &WorkflowState) -> Result<RouteDecision, ProviderError>;
}

/// 生成式评审的结构化输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReviewVerdict {
    pub is_complete: bool,
    /// 完成时写入记忆的总结
    #[serde(default)]
    pub memory_summary: Option<String>,
    /// 未完成时给下一轮的反馈
    #[serde(default)]
    pub feedback: Option<String>,
}

impl From<ReviewVerdict> for RouteDecision {
    fn from(v: ReviewVerdict) -> Self {
        if v.is_complete {
            RouteDecision {
                route: Route::Complete,
                summary: v.memory_summary,
                feedback: v.feedback,
            }
        } else {
            RouteDecision::proceed(v.feedback)
        }
    }
}

/// 交给生成提供方判断
pub struct GenerativeClassifier {
    provider: Arc<dyn GenerationProvider>,
    schema: Value,
}

impl GenerativeClassifier {
    pub fn new(provider: Arc<dyn GenerationProvider>) -> Self {
        Self {
            provider,
            schema: schema_value::<ReviewVerdict>(),
        }
    }

    fn build_prompt(state: &WorkflowState) -> String {
        let mut p = String::from(
            "Review the worker results below and decide whether the request is fully handled.\n",
        );
        let _ = writeln!(p, "Request: {}", state.request.replace('\n', " "));
        let _ = writeln!(p, "Completed calls: {}", state.actions.len());
        let _ = writeln!(p, "Results this cycle:");
        for action in state.current_cycle() {
            let line = match &action.result {
                ToolResult::Ok { output } => format!("ok {}", preview(output, 500)),
                ToolResult::Failed { error } => format!("failed {error}"),
            };
            let _ = writeln!(p, "- {}: {}", action.call.worker, line);
        }
        p
    }
}

#[async_trait]
impl RouteClassifier for GenerativeClassifier {
    async fn classify(&self, state: &WorkflowState) -> Result<RouteDecision, ProviderError> {
        let prompt = Self::build_prompt(state);
        let value = self
            .provider
            .generate(&prompt, Some(&self.schema))
            .await?
            .into_json()?;
        let verdict: ReviewVerdict = serde_json::from_value(value)
            .map_err(|e| ProviderError::InvalidResponse(format!("bad review verdict: {e}")))?;
        Ok(verdict.into())
    }
}

/// 确定性评审：本轮至少有一个结果且全部成功即完成
#[derive(Debug, Default, Clone, Copy)]
pub struct OutcomeClassifier;

#[async_trait]
impl RouteClassifier for OutcomeClassifier {
    async fn classify(&self, state: &WorkflowState) -> Result<RouteDecision, ProviderError> {
        let cycle: Vec<_> = state.current_cycle().collect();
        if cycle.is_empty() {
            return Ok(RouteDecision::proceed(Some(
                "no worker results in this cycle".to_string(),
            )));
        }
        let failures: Vec<String> = cycle
            .iter()
            .filter_map(|a| a.result.error().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            let workers: Vec<&str> = cycle.iter().map(|a| a.call.worker.as_str()).collect();
            Ok(RouteDecision::complete(Some(format!(
                "completed {} call(s): {}",
                cycle.len(),
                workers.join(", ")
            ))))
        } else {
            Ok(RouteDecision::proceed(Some(failures.join("; "))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;
    use crate::tools::{schema_title, DispatchError, WorkerCall};
    use crate::workflow::{ActionRecord, WorkflowRequest};
    use serde_json::json;

    fn state_with(results: Vec<ToolResult>) -> WorkflowState {
        let mut state = WorkflowState::new("t", WorkflowRequest::new("r"));
        state.step_count = 1;
        for result in results {
            state.actions.push(ActionRecord {
                step: 1,
                call: WorkerCall::new("w", json!({})),
                result,
            });
        }
        state
    }

    #[tokio::test]
    async fn test_outcome_classifier_routes() {
        let ok = ToolResult::Ok { output: json!(1) };
        let failed = ToolResult::Failed {
            error: DispatchError::Failed {
                worker: "w".to_string(),
                message: "boom".to_string(),
            },
        };
        let c = OutcomeClassifier;
        assert_eq!(c.classify(&state_with(vec![ok.clone()])).await.unwrap().route, Route::Complete);
        let d = c.classify(&state_with(vec![ok, failed])).await.unwrap();
        assert_eq!(d.route, Route::Continue);
        assert!(d.feedback.unwrap().contains("boom"));
        assert_eq!(c.classify(&state_with(vec![])).await.unwrap().route, Route::Continue);
    }

    #[tokio::test]
    async fn test_generative_classifier_maps_verdict() {
        let generator = Arc::new(
            ScriptedGenerator::new()
                .then_json(json!({"is_complete": false, "feedback": "dig deeper"}))
                .then_text("```json\n{\"is_complete\": true, \"memory_summary\": \"done\"}\n```"),
        );
        let c = GenerativeClassifier::new(generator);
        let state = state_with(vec![]);
        assert_eq!(
            c.classify(&state).await.unwrap(),
            RouteDecision::proceed(Some("dig deeper".to_string()))
        );
        assert_eq!(
            c.classify(&state).await.unwrap(),
            RouteDecision::complete(Some("done".to_string()))
        );
    }

    #[test]
    fn test_review_schema_title() {
        let schema = schema_value::<ReviewVerdict>();
        assert_eq!(schema_title(&schema), Some("ReviewVerdict"));
    }
}
