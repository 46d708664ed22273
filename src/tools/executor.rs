//! 任务分发器
//!
//! dispatch(worker, input)：先按 input_schema 校验（失败即 Validation，不重试），再在独立 tokio 任务中
//! 调用 worker 并施加超时；超时会 abort 该任务，worker 的 Err 与 panic 都转为 DispatchError 而不向上抛出。
//! dispatch_all 并发执行一组独立调用，join 后按请求顺序返回；整批一次性取并发许可，批内调用互不排队。
//! 每次调用输出一行 JSON 审计日志。
//!
//! worker 只拿到调用方给出的 input（一份拷贝），看不到 supervisor 的状态。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::core::TaskScheduler;
use crate::tools::schema::preview;
use crate::tools::WorkerRegistry;

/// 一次 worker 调用：worker 名 + 最小输入，可选单独超时
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkerCall {
    pub worker: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkerCall {
    pub fn new(worker: impl Into<String>, input: Value) -> Self {
        Self {
            worker: worker.into(),
            input,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// 单次调用失败；可序列化，直接作为失败标记写入工作流状态
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("invalid input for {worker}: {}", errors.join("; "))]
    Validation { worker: String, errors: Vec<String> },

    #[error("unknown worker {worker}; available: {}", available.join(", "))]
    UnknownWorker {
        worker: String,
        available: Vec<String>,
    },

    #[error("worker {worker} failed: {message}")]
    Failed { worker: String, message: String },

    #[error("worker {worker} timed out after {timeout_ms}ms")]
    Timeout { worker: String, timeout_ms: u64 },

    #[error("worker {worker} panicked: {message}")]
    Panicked { worker: String, message: String },
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Validation { .. } => "validation",
            DispatchError::UnknownWorker { .. } => "unknown_worker",
            DispatchError::Failed { .. } => "failed",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Panicked { .. } => "panicked",
        }
    }

    pub fn worker(&self) -> &str {
        match self {
            DispatchError::Validation { worker, .. }
            | DispatchError::UnknownWorker { worker, .. }
            | DispatchError::Failed { worker, .. }
            | DispatchError::Timeout { worker, .. }
            | DispatchError::Panicked { worker, .. } => worker,
        }
    }
}

pub type CallOutcome = Result<Value, DispatchError>;

/// 每次调用一行 JSON 审计日志
fn audit(call: &WorkerCall, result: &CallOutcome, elapsed: Duration) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    let audit = serde_json::json!({
        "event": "worker_audit",
        "worker": call.worker,
        "ok": result.is_ok(),
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "input_preview": preview(&call.input, 200),
    });
    tracing::info!(audit = %audit.to_string(), "worker");
}

pub struct TaskDispatcher {
    registry: Arc<WorkerRegistry>,
    scheduler: TaskScheduler,
    timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, timeout_ms: u64) -> Self {
        Self {
            registry,
            scheduler: TaskScheduler::default(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行单个调用；任何失败都以 DispatchError 返回
    pub async fn dispatch(&self, call: &WorkerCall) -> CallOutcome {
        match self.scheduler.acquire_worker().await {
            Ok(permit) => {
                let outcome = self.execute(call).await;
                drop(permit);
                outcome
            }
            Err(_) => Self::closed(call),
        }
    }

    /// 并发执行一组独立调用；结果数量与顺序与 calls 一致。
    /// 整批一次取许可，批内调用同时启动，挂起的调用只让自己超时。
    pub async fn dispatch_all(&self, calls: &[WorkerCall]) -> Vec<CallOutcome> {
        if calls.is_empty() {
            return Vec::new();
        }
        match self.scheduler.acquire_batch(calls.len()).await {
            Ok(permit) => {
                let outcomes = join_all(calls.iter().map(|call| self.execute(call))).await;
                drop(permit);
                outcomes
            }
            Err(_) => calls.iter().map(Self::closed).collect(),
        }
    }

    fn closed(call: &WorkerCall) -> CallOutcome {
        let result = Err(DispatchError::Failed {
            worker: call.worker.clone(),
            message: "dispatcher closed".to_string(),
        });
        audit(call, &result, Duration::ZERO);
        result
    }

    async fn execute(&self, call: &WorkerCall) -> CallOutcome {
        let start = Instant::now();
        let result = self.run(call).await;
        audit(call, &result, start.elapsed());
        result
    }

    async fn run(&self, call: &WorkerCall) -> CallOutcome {
        let worker_name = call.worker.clone();
        let Some(worker) = self.registry.get(&worker_name) else {
            return Err(DispatchError::UnknownWorker {
                worker: worker_name,
                available: self.registry.worker_names(),
            });
        };
        if let Some(Err(errors)) = self.registry.validate(&worker_name, &call.input) {
            return Err(DispatchError::Validation {
                worker: worker_name,
                errors,
            });
        }

        let limit = call
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        let input = call.input.clone();
        let mut handle = tokio::spawn(async move { worker.invoke(input).await });

        match timeout(limit, &mut handle).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(message))) => Err(DispatchError::Failed {
                worker: worker_name,
                message,
            }),
            Ok(Err(join_err)) => Err(DispatchError::Panicked {
                worker: worker_name,
                message: join_err.to_string(),
            }),
            Err(_) => {
                handle.abort();
                Err(DispatchError::Timeout {
                    worker: worker_name,
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}
