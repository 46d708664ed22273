//! 监督工作流：状态类型、字段 reducer、checkpoint 存储、Plan → Act → Review 引擎

pub mod checkpoint;
pub mod engine;
pub mod reducer;
pub mod types;

pub use checkpoint::{
    CheckpointEntry, CheckpointError, CheckpointStore, InMemoryCheckpointStore,
    SqliteCheckpointStore,
};
pub use engine::WorkflowEngine;
pub use reducer::StateUpdate;
pub use types::{
    ActionRecord, Diagnostic, FailureReason, ToolResult, WorkflowRequest, WorkflowState,
    WorkflowStatus,
};
