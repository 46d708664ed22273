//! 工作流过程事件：供调用方实时观察 Plan / Act / Review 进度

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// 进入第几个规划步
    StepUpdate {
        thread_id: String,
        step: u32,
        max_steps: u32,
    },
    /// 规划结果：委托给哪些 worker
    Delegation {
        thread_id: String,
        plan: Option<String>,
        workers: Vec<String>,
    },
    /// worker 返回（预览）
    Observation {
        thread_id: String,
        worker: String,
        preview: String,
    },
    WorkerFailure {
        thread_id: String,
        worker: String,
        reason: String,
    },
    /// 提供方失败后退避重试
    Retry {
        thread_id: String,
        stage: String,
        attempt: u32,
        delay_ms: u64,
    },
    Completed {
        thread_id: String,
        summary: Option<String>,
    },
    Failed {
        thread_id: String,
        reason: String,
    },
}
