//! 工作流引擎：Plan → Act → Review 状态机
//!
//! - 每次迁移产出一个 StateUpdate，应用后以 CAS 写入 CheckpointStore，写入成功才算迁移完成
//! - PLANNING 入口检查步数上限：step_count 达到 max_steps 即进入 ERROR（max_steps_exceeded）
//! - 规划/评审阶段的提供方失败按退避重试，耗尽后进入 ERROR 并附带诊断
//! - Act 阶段 worker 失败不致命，转为 feedback 交给下一轮规划
//! - 取消只在挂起边界（两次迁移之间、退避等待中）生效，不会打断进行中的 worker 调用

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{HiveError, RecoveryAction, RecoveryEngine};
use crate::llm::{ProviderError, RetryPolicy};
use crate::memory::{MemoryRecord, MemoryStore, ScoredRecord};
use crate::react::{Critic, Planner, PlannerOutput, Route, WorkflowEvent};
use crate::tools::schema::preview;
use crate::tools::TaskDispatcher;
use crate::workflow::{
    ActionRecord, CheckpointStore, Diagnostic, FailureReason, StateUpdate, ToolResult,
    WorkflowRequest, WorkflowState, WorkflowStatus,
};

pub struct WorkflowEngine {
    planner: Planner,
    critic: Critic,
    dispatcher: Arc<TaskDispatcher>,
    memory: Arc<MemoryStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    recovery: RecoveryEngine,
    retry: RetryPolicy,
    max_steps: u32,
    /// 每个命名空间检索的记忆条数
    memory_context_k: usize,
    event_tx: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl WorkflowEngine {
    pub fn new(
        planner: Planner,
        critic: Critic,
        dispatcher: Arc<TaskDispatcher>,
        memory: Arc<MemoryStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let retry = RetryPolicy::default();
        Self {
            planner,
            critic,
            dispatcher,
            memory,
            checkpoints,
            recovery: RecoveryEngine::new(retry.max_retries),
            retry,
            max_steps: 10,
            memory_context_k: 3,
            event_tx: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.recovery = RecoveryEngine::new(retry.max_retries);
        self.retry = retry;
        self
    }

    pub fn with_memory_context_k(mut self, k: usize) -> Self {
        self.memory_context_k = k;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// 启动（或在已有 checkpoint 时继续）一个 thread，直到 DONE / ERROR
    pub async fn run(
        &self,
        thread_id: &str,
        request: WorkflowRequest,
    ) -> Result<WorkflowState, HiveError> {
        self.run_with_cancel(thread_id, request, &CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        thread_id: &str,
        request: WorkflowRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState, HiveError> {
        if let Some(entry) = self.checkpoints.get(thread_id).await? {
            tracing::info!(
                thread_id,
                version = entry.version,
                "thread already checkpointed, resuming"
            );
            let state = entry.state()?;
            return self.drive(state, entry.version, cancel).await;
        }
        let state = WorkflowState::new(thread_id, request);
        let version = self.commit(&state, 0).await?;
        tracing::info!(thread_id, "workflow started");
        self.drive(state, version, cancel).await
    }

    /// 从最新 checkpoint 继续；终态直接返回，不会重放任何 worker 调用
    pub async fn resume(&self, thread_id: &str) -> Result<WorkflowState, HiveError> {
        self.resume_with_cancel(thread_id, &CancellationToken::new())
            .await
    }

    pub async fn resume_with_cancel(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState, HiveError> {
        let entry = self
            .checkpoints
            .get(thread_id)
            .await?
            .ok_or_else(|| HiveError::ThreadNotFound(thread_id.to_string()))?;
        let state = entry.state()?;
        tracing::info!(
            thread_id,
            version = entry.version,
            status = %state.status,
            "resuming workflow"
        );
        self.drive(state, entry.version, cancel).await
    }

    async fn drive(
        &self,
        mut state: WorkflowState,
        mut version: u64,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState, HiveError> {
        loop {
            if state.status.is_terminal() {
                return Ok(state);
            }
            if cancel.is_cancelled() {
                tracing::info!(
                    thread_id = %state.thread_id,
                    status = %state.status,
                    "workflow cancelled"
                );
                self.emit(WorkflowEvent::Failed {
                    thread_id: state.thread_id.clone(),
                    reason: "cancelled".to_string(),
                });
                return Err(HiveError::Cancelled);
            }

            let update = match state.status {
                WorkflowStatus::Planning => self.plan(&state, cancel).await?,
                WorkflowStatus::Acting => self.act(&state).await,
                WorkflowStatus::Reviewing => self.review(&state, cancel).await?,
                WorkflowStatus::Done | WorkflowStatus::Error => return Ok(state),
            };

            let mut next = state.clone();
            update.apply(&mut next);
            version = self.commit(&next, version).await?;
            tracing::debug!(
                thread_id = %next.thread_id,
                from = %state.status,
                to = %next.status,
                version,
                "transition committed"
            );
            state = next;

            match state.status {
                WorkflowStatus::Done => self.emit(WorkflowEvent::Completed {
                    thread_id: state.thread_id.clone(),
                    summary: state.summary.clone(),
                }),
                WorkflowStatus::Error => self.emit(WorkflowEvent::Failed {
                    thread_id: state.thread_id.clone(),
                    reason: state
                        .diagnostic
                        .as_ref()
                        .map(|d| d.reason.as_str().to_string())
                        .unwrap_or_default(),
                }),
                _ => {}
            }
        }
    }

    async fn commit(&self, state: &WorkflowState, expected_version: u64) -> Result<u64, HiveError> {
        self.checkpoints
            .put(&state.thread_id, state, expected_version)
            .await
            .map_err(|e| {
                let err = HiveError::from(e);
                tracing::error!(thread_id = %state.thread_id, "checkpoint write rejected: {}", err);
                err
            })
    }

    fn fail(diagnostic: Diagnostic) -> StateUpdate {
        StateUpdate::new()
            .pending_calls(Vec::new())
            .status(WorkflowStatus::Error)
            .diagnostic(diagnostic)
    }

    /// PLANNING：检索记忆 → 规划 → 委托（ACTING）或完成（REVIEWING）
    async fn plan(
        &self,
        state: &WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<StateUpdate, HiveError> {
        if state.step_count >= self.max_steps {
            tracing::warn!(
                thread_id = %state.thread_id,
                max_steps = self.max_steps,
                "step budget exhausted"
            );
            return Ok(Self::fail(Diagnostic {
                reason: FailureReason::MaxStepsExceeded,
                stage: WorkflowStatus::Planning.to_string(),
                message: format!("no completion within {} steps", self.max_steps),
                attempts: 0,
            }));
        }
        let step = state.step_count + 1;
        self.emit(WorkflowEvent::StepUpdate {
            thread_id: state.thread_id.clone(),
            step,
            max_steps: self.max_steps,
        });
        tracing::info!(thread_id = %state.thread_id, step, "planning");

        let outcome = self
            .with_retry(state, WorkflowStatus::Planning, cancel, move || async move {
                let memory = self.recall(state).await?;
                self.planner.plan(state, &memory).await
            })
            .await?;

        let update = match outcome {
            Err(diagnostic) => return Ok(Self::fail(diagnostic)),
            Ok(PlannerOutput::Delegate {
                plan,
                calls,
                feedback,
            }) => {
                self.emit(WorkflowEvent::Delegation {
                    thread_id: state.thread_id.clone(),
                    plan: plan.clone(),
                    workers: calls.iter().map(|c| c.worker.clone()).collect(),
                });
                StateUpdate::new()
                    .step_count(step)
                    .plan(plan)
                    .pending_calls(calls)
                    .feedback(feedback)
                    .status(WorkflowStatus::Acting)
            }
            Ok(PlannerOutput::Complete { summary }) => StateUpdate::new()
                .step_count(step)
                .pending_calls(Vec::new())
                .task_complete(true)
                .summary(Some(summary))
                .status(WorkflowStatus::Reviewing),
        };
        Ok(update)
    }

    /// ACTING：并发执行本轮调用，结果（含失败）全部写入状态
    async fn act(&self, state: &WorkflowState) -> StateUpdate {
        let calls = state.pending_calls.clone();
        tracing::info!(thread_id = %state.thread_id, calls = calls.len(), "dispatching");
        let outcomes = self.dispatcher.dispatch_all(&calls).await;

        let mut update = StateUpdate::new();
        let mut failures = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (call, outcome) in calls.iter().zip(outcomes) {
            let count = seen.entry(call.worker.as_str()).or_insert(0);
            *count += 1;
            let key = if *count == 1 {
                call.worker.clone()
            } else {
                format!("{}#{}", call.worker, count)
            };

            match &outcome {
                Ok(output) => self.emit(WorkflowEvent::Observation {
                    thread_id: state.thread_id.clone(),
                    worker: call.worker.clone(),
                    preview: preview(output, 200),
                }),
                Err(error) => {
                    let reason = error.to_string();
                    let note = match self.recovery.handle(&HiveError::from(error.clone()), 1) {
                        RecoveryAction::FeedBack(msg) => msg,
                        _ => reason.clone(),
                    };
                    tracing::warn!(
                        thread_id = %state.thread_id,
                        worker = %call.worker,
                        "worker failed: {}",
                        reason
                    );
                    self.emit(WorkflowEvent::WorkerFailure {
                        thread_id: state.thread_id.clone(),
                        worker: call.worker.clone(),
                        reason,
                    });
                    failures.push(note);
                }
            }

            let result = ToolResult::from(outcome);
            update = update.tool_result(key, result.clone()).action(ActionRecord {
                step: state.step_count,
                call: call.clone(),
                result,
            });
        }

        let feedback = if failures.is_empty() {
            None
        } else {
            Some(failures.join("\n"))
        };
        update
            .pending_calls(Vec::new())
            .feedback(feedback)
            .status(WorkflowStatus::Reviewing)
    }

    /// REVIEWING：完成则写记忆并进入 DONE，否则带着反馈回到 PLANNING
    async fn review(
        &self,
        state: &WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<StateUpdate, HiveError> {
        let outcome = self
            .with_retry(state, WorkflowStatus::Reviewing, cancel, move || async move {
                self.critic.review(state).await
            })
            .await?;
        let decision = match outcome {
            Ok(decision) => decision,
            Err(diagnostic) => return Ok(Self::fail(diagnostic)),
        };

        match decision.route {
            Route::Continue => {
                tracing::info!(
                    thread_id = %state.thread_id,
                    step = state.step_count,
                    "review: continue"
                );
                Ok(StateUpdate::new()
                    .pending_calls(Vec::new())
                    .feedback(decision.feedback)
                    .status(WorkflowStatus::Planning))
            }
            Route::Complete => {
                let summary = decision
                    .summary
                    .or_else(|| state.summary.clone())
                    .unwrap_or_else(|| "completed".to_string());
                // 每条记录单独重试：已写入的情景记忆不会因后续失败被重复计数
                for record in Self::memories(state, &summary) {
                    let written = self
                        .with_retry(state, WorkflowStatus::Reviewing, cancel, || {
                            let record = record.clone();
                            async move { self.memory.write(record).await }
                        })
                        .await?;
                    match written {
                        Ok(outcome) => tracing::debug!(
                            thread_id = %state.thread_id,
                            kind = outcome.record().kind().as_str(),
                            merged = outcome.is_merged(),
                            "memory recorded"
                        ),
                        Err(diagnostic) => return Ok(Self::fail(diagnostic)),
                    }
                }
                tracing::info!(
                    thread_id = %state.thread_id,
                    step = state.step_count,
                    "review: complete"
                );
                Ok(StateUpdate::new()
                    .pending_calls(Vec::new())
                    .task_complete(true)
                    .summary(Some(summary))
                    .feedback(decision.feedback)
                    .status(WorkflowStatus::Done))
            }
        }
    }

    /// 从作用域的四个命名空间检索与请求相关的记忆，按显著性排序
    async fn recall(&self, state: &WorkflowState) -> Result<Vec<ScoredRecord>, ProviderError> {
        if self.memory_context_k == 0 {
            return Ok(Vec::new());
        }
        let mut context = Vec::new();
        for namespace in state.scope.namespaces() {
            context.extend(
                self.memory
                    .search(&namespace, &state.request, self.memory_context_k)
                    .await?,
            );
        }
        context.sort_by(|a, b| b.salience.total_cmp(&a.salience));
        Ok(context)
    }

    /// 完成时要写入的记忆：一条情景记忆；有成功动作时再加一条程序记忆
    fn memories(state: &WorkflowState, summary: &str) -> Vec<MemoryRecord> {
        let actions: Vec<String> = state
            .actions
            .iter()
            .map(|a| {
                format!(
                    "{}({})",
                    a.call.worker,
                    if a.result.is_ok() { "ok" } else { "failed" }
                )
            })
            .collect();
        let text = format!(
            "Request: {}\nActions: {}\nOutcome: {}",
            state.request,
            if actions.is_empty() {
                "none".to_string()
            } else {
                actions.join(", ")
            },
            summary
        );
        let mut records = vec![MemoryRecord::episodic(
            state.scope.episodes(),
            state.thread_id.clone(),
            "supervisor",
            text,
        )];

        let steps: Vec<serde_json::Value> = state
            .successful_actions()
            .map(|a| json!({ "worker": a.call.worker, "input": a.call.input }))
            .collect();
        if !steps.is_empty() {
            records.push(MemoryRecord::procedural(
                state.scope.procedures(),
                state.scope.task_id.clone(),
                steps,
                summary,
            ));
        }
        records
    }

    /// 提供方调用的退避重试；外层 Err 为取消，内层 Err 为重试耗尽的诊断
    async fn with_retry<T, F, Fut>(
        &self,
        state: &WorkflowState,
        stage: WorkflowStatus,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Result<T, Diagnostic>, HiveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(Ok(value)),
                Err(err) => err,
            };
            attempt += 1;
            match self
                .recovery
                .handle(&HiveError::TransientProvider(err.clone()), attempt)
            {
                RecoveryAction::RetryWithBackoff => {
                    let delay = self.retry.delay_for(attempt, Some(&err));
                    tracing::warn!(
                        thread_id = %state.thread_id,
                        stage = %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "provider error, retrying: {}",
                        err
                    );
                    self.emit(WorkflowEvent::Retry {
                        thread_id: state.thread_id.clone(),
                        stage: stage.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(HiveError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                action => {
                    tracing::error!(
                        thread_id = %state.thread_id,
                        stage = %stage,
                        attempts = attempt,
                        ?action,
                        "provider retries exhausted: {}",
                        err
                    );
                    return Ok(Err(Diagnostic {
                        reason: FailureReason::ProviderRetriesExhausted,
                        stage: stage.to_string(),
                        message: err.to_string(),
                        attempts: attempt,
                    }));
                }
            }
        }
    }
}
