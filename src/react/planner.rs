//! Planner：把请求、已有结果、反馈与记忆上下文拼成 prompt，请求结构化 SupervisorDecision
//!
//! 决策必须二选一：委托（calls 非空）或完成（complete = true）；两者皆有或皆无视为 InvalidResponse。
//! 文本回复中若没有 JSON，则视为完成，文本即总结。

use std::fmt::Write as _;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{extract_json_block, Generation, GenerationProvider, ProviderError};
use crate::memory::{MemoryKind, ScoredRecord};
use crate::tools::schema::{preview, schema_value};
use crate::tools::WorkerCall;
use crate::workflow::{ToolResult, WorkflowState};

/// supervisor 的一次决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SupervisorDecision {
    /// 当前计划（自由文本）
    #[serde(default)]
    pub plan: Option<String>,
    /// 本轮要委托的 worker 调用；彼此独立，会并发执行
    #[serde(default)]
    pub calls: Vec<WorkerCall>,
    /// 任务已完成
    #[serde(default)]
    pub complete: bool,
    /// 给调用方或下一轮的说明；完成时作为总结
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    Delegate {
        plan: Option<String>,
        calls: Vec<WorkerCall>,
        feedback: Option<String>,
    },
    Complete {
        summary: String,
    },
}

impl TryFrom<SupervisorDecision> for PlannerOutput {
    type Error = ProviderError;

    fn try_from(decision: SupervisorDecision) -> Result<Self, Self::Error> {
        match (decision.complete, decision.calls.is_empty()) {
            (true, false) => Err(ProviderError::InvalidResponse(
                "decision both completes and delegates".to_string(),
            )),
            (false, true) => Err(ProviderError::InvalidResponse(
                "decision neither completes nor delegates".to_string(),
            )),
            (true, true) => Ok(PlannerOutput::Complete {
                summary: decision
                    .feedback
                    .or(decision.plan)
                    .unwrap_or_else(|| "completed".to_string()),
            }),
            (false, false) => Ok(PlannerOutput::Delegate {
                plan: decision.plan,
                calls: decision.calls,
                feedback: decision.feedback,
            }),
        }
    }
}

/// 解析生成结果
pub fn parse_decision(generation: Generation) -> Result<PlannerOutput, ProviderError> {
    let value = match generation {
        Generation::Structured(value) => value,
        Generation::Text(text) => match extract_json_block(&text) {
            Some(block) => serde_json::from_str(block)
                .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {}", block)))?,
            None => {
                return Ok(PlannerOutput::Complete {
                    summary: text.trim().to_string(),
                })
            }
        },
    };
    let decision: SupervisorDecision = serde_json::from_value(value)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad decision: {e}")))?;
    PlannerOutput::try_from(decision)
}

const INSTRUCTIONS: &str = "You are a supervisor coordinating workers. \
Either delegate one or more independent worker calls, or declare the task complete. \
Never both. Give each worker only the input it needs.";

pub struct Planner {
    provider: Arc<dyn GenerationProvider>,
    catalogue: String,
    schema: Value,
}

impl Planner {
    /// catalogue：worker 列表 JSON（name / description / input_schema）
    pub fn new(provider: Arc<dyn GenerationProvider>, catalogue: impl Into<String>) -> Self {
        Self {
            provider,
            catalogue: catalogue.into(),
            schema: schema_value::<SupervisorDecision>(),
        }
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub async fn plan(
        &self,
        state: &WorkflowState,
        memory: &[ScoredRecord],
    ) -> Result<PlannerOutput, ProviderError> {
        let prompt = self.build_prompt(state, memory);
        let generation = self.provider.generate(&prompt, Some(&self.schema)).await?;
        parse_decision(generation)
    }

    pub fn build_prompt(&self, state: &WorkflowState, memory: &[ScoredRecord]) -> String {
        let mut p = String::new();
        let _ = writeln!(p, "{INSTRUCTIONS}");
        let _ = writeln!(p, "Request: {}", state.request.replace('\n', " "));
        let _ = writeln!(p, "Current plan: {}", state.plan.as_deref().unwrap_or("(none)"));
        let _ = writeln!(p, "Completed calls: {}", state.actions.len());
        if let Some(feedback) = &state.feedback {
            let _ = writeln!(p, "Feedback: {feedback}");
        }
        if !state.tool_results.is_empty() {
            let _ = writeln!(p, "Tool results:");
            for (key, result) in &state.tool_results {
                let _ = writeln!(p, "- {key}: {}", render_result(result));
            }
        }
        for kind in [
            MemoryKind::Semantic,
            MemoryKind::Episodic,
            MemoryKind::Procedural,
            MemoryKind::Instruction,
        ] {
            let lines: Vec<&ScoredRecord> =
                memory.iter().filter(|m| m.record.kind() == kind).collect();
            if lines.is_empty() {
                continue;
            }
            let _ = writeln!(p, "Relevant {} memory:", kind.as_str());
            for m in lines {
                let _ = writeln!(p, "- ({:.2}) {}", m.salience, m.record.payload.content_text());
            }
        }
        let _ = writeln!(p, "Available workers:\n{}", self.catalogue);
        p
    }
}

fn render_result(result: &ToolResult) -> String {
    match result {
        ToolResult::Ok { output } => format!("ok {}", preview(output, 500)),
        ToolResult::Failed { error } => format!("failed ({}) {}", error.kind(), error),
    }
}
