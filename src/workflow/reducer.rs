//! 字段级 reducer
//!
//! 每次迁移产出一个 StateUpdate，按字段固定的规则合并进 WorkflowState：
//! - step_count：单调（取较大值）
//! - plan / pending_calls / feedback / task_complete / status / summary / diagnostic：后写覆盖
//! - tool_results：map 合并（同键覆盖）
//! - actions：追加

use std::collections::BTreeMap;

use chrono::Utc;

use crate::tools::WorkerCall;
use crate::workflow::{ActionRecord, Diagnostic, ToolResult, WorkflowState, WorkflowStatus};

fn last_write<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn monotonic(slot: &mut u32, value: Option<u32>) {
    if let Some(value) = value {
        *slot = (*slot).max(value);
    }
}

fn merge_map<K: Ord, V>(slot: &mut BTreeMap<K, V>, values: BTreeMap<K, V>) {
    slot.extend(values);
}

fn append<T>(slot: &mut Vec<T>, values: Vec<T>) {
    slot.extend(values);
}

/// 一次迁移对状态的部分更新；未设置的字段保持不变
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub step_count: Option<u32>,
    pub plan: Option<Option<String>>,
    pub pending_calls: Option<Vec<WorkerCall>>,
    pub tool_results: BTreeMap<String, ToolResult>,
    pub actions: Vec<ActionRecord>,
    pub feedback: Option<Option<String>>,
    pub task_complete: Option<bool>,
    pub status: Option<WorkflowStatus>,
    pub summary: Option<Option<String>>,
    pub diagnostic: Option<Option<Diagnostic>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_count(mut self, step_count: u32) -> Self {
        self.step_count = Some(step_count);
        self
    }

    pub fn plan(mut self, plan: Option<String>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn pending_calls(mut self, calls: Vec<WorkerCall>) -> Self {
        self.pending_calls = Some(calls);
        self
    }

    pub fn tool_result(mut self, key: impl Into<String>, result: ToolResult) -> Self {
        self.tool_results.insert(key.into(), result);
        self
    }

    pub fn action(mut self, action: ActionRecord) -> Self {
        self.actions.push(action);
        self
    }

    pub fn feedback(mut self, feedback: Option<String>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn task_complete(mut self, complete: bool) -> Self {
        self.task_complete = Some(complete);
        self
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn summary(mut self, summary: Option<String>) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostic = Some(Some(diagnostic));
        self
    }

    /// 按字段 reducer 应用到 state，并刷新 updated_at
    pub fn apply(self, state: &mut WorkflowState) {
        monotonic(&mut state.step_count, self.step_count);
        last_write(&mut state.plan, self.plan);
        last_write(&mut state.pending_calls, self.pending_calls);
        merge_map(&mut state.tool_results, self.tool_results);
        append(&mut state.actions, self.actions);
        last_write(&mut state.feedback, self.feedback);
        last_write(&mut state.task_complete, self.task_complete);
        last_write(&mut state.status, self.status);
        last_write(&mut state.summary, self.summary);
        last_write(&mut state.diagnostic, self.diagnostic);
        state.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowRequest;
    use serde_json::json;

    fn state() -> WorkflowState {
        WorkflowState::new("t", WorkflowRequest::new("r"))
    }

    #[test]
    fn test_step_count_never_decreases() {
        let mut s = state();
        StateUpdate::new().step_count(3).apply(&mut s);
        StateUpdate::new().step_count(1).apply(&mut s);
        assert_eq!(s.step_count, 3);
    }

    #[test]
    fn test_tool_results_merge_and_actions_append() {
        let mut s = state();
        let ok = |v| ToolResult::Ok { output: json!(v) };
        StateUpdate::new()
            .tool_result("a", ok(1))
            .tool_result("b", ok(2))
            .apply(&mut s);
        StateUpdate::new().tool_result("a", ok(3)).apply(&mut s);
        assert_eq!(s.tool_results.len(), 2);
        assert_eq!(s.tool_results["a"], ok(3));

        let call = WorkerCall::new("a", json!({}));
        for step in 1..=2 {
            StateUpdate::new()
                .action(ActionRecord {
                    step,
                    call: call.clone(),
                    result: ok(step),
                })
                .apply(&mut s);
        }
        assert_eq!(s.actions.len(), 2);
    }

    #[test]
    fn test_unset_fields_are_untouched() {
        let mut s = state();
        StateUpdate::new()
            .plan(Some("p".to_string()))
            .feedback(Some("f".to_string()))
            .apply(&mut s);
        StateUpdate::new().status(WorkflowStatus::Acting).apply(&mut s);
        assert_eq!(s.plan.as_deref(), Some("p"));
        assert_eq!(s.feedback.as_deref(), Some("f"));
        StateUpdate::new().feedback(None).apply(&mut s);
        assert!(s.feedback.is_none());
    }
}
