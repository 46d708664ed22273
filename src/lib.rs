//! Hive - 监督式 Plan → Act → Review 运行时与带显著性评分的长期记忆
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、worker 并发池、运行时组装、优雅关闭
//! - **llm**: 生成 / 相似度提供方抽象、退避策略、Mock 实现
//! - **memory**: 记忆记录、显著性评分、命名空间存储、后台整理
//! - **observability**: tracing 初始化
//! - **react**: Planner、Critic 与 Review 路由、过程事件
//! - **tools**: worker 注册表与任务分发器
//! - **workflow**: 工作流状态、reducer、checkpoint、状态机引擎

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
pub mod workflow;

pub use crate::core::{HiveError, Runtime, RuntimeBuilder};
pub use crate::workflow::{WorkflowEngine, WorkflowRequest, WorkflowState, WorkflowStatus};
