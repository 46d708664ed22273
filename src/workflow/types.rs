//! 工作流状态类型
//!
//! WorkflowState 是单个 thread 的全部状态，只通过 StateUpdate 的各字段 reducer 修改，
//! 每次迁移后整体序列化写入 CheckpointStore。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::MemoryScope;
use crate::tools::{CallOutcome, DispatchError, WorkerCall};

/// 调用方提交的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub request: String,
    #[serde(default)]
    pub scope: MemoryScope,
}

impl WorkflowRequest {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            scope: MemoryScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: MemoryScope) -> Self {
        self.scope = scope;
        self
    }
}

/// PLANNING → ACTING → REVIEWING → {PLANNING | DONE | ERROR}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Planning,
    Acting,
    Reviewing,
    Done,
    Error,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Done | WorkflowStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Acting => "acting",
            WorkflowStatus::Reviewing => "reviewing",
            WorkflowStatus::Done => "done",
            WorkflowStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次调用结果：成功输出或显式失败标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Ok { output: Value },
    Failed { error: DispatchError },
}

impl ToolResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolResult::Ok { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            ToolResult::Ok { output } => Some(output),
            ToolResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&DispatchError> {
        match self {
            ToolResult::Ok { .. } => None,
            ToolResult::Failed { error } => Some(error),
        }
    }
}

impl From<CallOutcome> for ToolResult {
    fn from(outcome: CallOutcome) -> Self {
        match outcome {
            Ok(output) => ToolResult::Ok { output },
            Err(error) => ToolResult::Failed { error },
        }
    }
}

/// 动作日志条目（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// 发起该调用的规划步
    pub step: u32,
    pub call: WorkerCall,
    pub result: ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxStepsExceeded,
    ProviderRetriesExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxStepsExceeded => "max_steps_exceeded",
            FailureReason::ProviderRetriesExhausted => "provider_retries_exhausted",
        }
    }
}

/// 进入 ERROR 时附带的结构化诊断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub reason: FailureReason,
    /// 出错阶段：planning / reviewing
    pub stage: String,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub thread_id: String,
    pub request: String,
    pub scope: MemoryScope,
    pub step_count: u32,
    pub plan: Option<String>,
    /// 本轮待执行的调用（单个或一组扇出）
    pub pending_calls: Vec<WorkerCall>,
    /// worker 名 -> 最近一次结果；同一轮内重名调用以 `#n` 后缀区分
    pub tool_results: BTreeMap<String, ToolResult>,
    pub actions: Vec<ActionRecord>,
    pub feedback: Option<String>,
    pub task_complete: bool,
    pub status: WorkflowStatus,
    pub summary: Option<String>,
    pub diagnostic: Option<Diagnostic>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(thread_id: impl Into<String>, request: WorkflowRequest) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            request: request.request,
            scope: request.scope,
            step_count: 0,
            plan: None,
            pending_calls: Vec::new(),
            tool_results: BTreeMap::new(),
            actions: Vec::new(),
            feedback: None,
            task_complete: false,
            status: WorkflowStatus::Planning,
            summary: None,
            diagnostic: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 当前规划步产生的动作
    pub fn current_cycle(&self) -> impl Iterator<Item = &ActionRecord> {
        let step = self.step_count;
        self.actions.iter().filter(move |a| a.step == step)
    }

    pub fn successful_actions(&self) -> impl Iterator<Item = &ActionRecord> {
        self.actions.iter().filter(|a| a.result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut state = WorkflowState::new("t1", WorkflowRequest::new("hello"));
        state.tool_results.insert(
            "echo".to_string(),
            ToolResult::Failed {
                error: DispatchError::Timeout {
                    worker: "echo".to_string(),
                    timeout_ms: 10,
                },
            },
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.contains("\"status\":\"planning\""));
    }

    #[test]
    fn test_current_cycle_filters_by_step() {
        let mut state = WorkflowState::new("t1", WorkflowRequest::new("hello"));
        let call = WorkerCall::new("echo", serde_json::json!({"text": "x"}));
        for step in [1, 2, 2] {
            state.actions.push(ActionRecord {
                step,
                call: call.clone(),
                result: ToolResult::Ok { output: Value::Null },
            });
        }
        state.step_count = 2;
        assert_eq!(state.current_cycle().count(), 2);
    }
}
