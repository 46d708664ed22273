//! Worker 注册表
//!
//! 所有 worker 实现 Worker trait（name / description / input_schema / invoke），由 WorkerRegistry
//! 按名注册。注册时编译 input_schema；注册后条目不可变，重名注册直接拒绝。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Worker trait：名称、描述（供 planner 理解）、输入 schema、异步调用（输入输出均为 JSON）
#[async_trait]
pub trait Worker: Send + Sync {
    /// 名称（对应 decision 中 calls[].worker）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 输入 JSON Schema；默认接受任意对象
    fn input_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    /// 执行；Err 为 worker 自报的失败，会作为反馈交给下一轮规划
    async fn invoke(&self, input: Value) -> Result<Value, String>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("worker already registered: {0}")]
    Duplicate(String),

    #[error("invalid input schema for worker {worker}: {message}")]
    InvalidSchema { worker: String, message: String },
}

/// 对外暴露的 worker 描述（写入 planner prompt 的 catalogue）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

struct RegisteredWorker {
    descriptor: WorkerDescriptor,
    validator: JSONSchema,
    worker: Arc<dyn Worker>,
}

/// 按名称排序存储，catalogue 输出顺序稳定
#[derive(Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, RegisteredWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: impl Worker + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(worker))
    }

    pub fn register_arc(&mut self, worker: Arc<dyn Worker>) -> Result<(), RegistryError> {
        let name = worker.name().to_string();
        if self.workers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        let input_schema = worker.input_schema();
        let validator =
            JSONSchema::compile(&input_schema).map_err(|e| RegistryError::InvalidSchema {
                worker: name.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!(worker = %name, "worker registered");
        self.workers.insert(
            name.clone(),
            RegisteredWorker {
                descriptor: WorkerDescriptor {
                    name,
                    description: worker.description().to_string(),
                    input_schema,
                },
                validator,
                worker,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).map(|w| Arc::clone(&w.worker))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// 按 worker 的 input_schema 校验输入；未注册返回 None
    pub fn validate(&self, name: &str, input: &Value) -> Option<Result<(), Vec<String>>> {
        let entry = self.workers.get(name)?;
        Some(
            entry
                .validator
                .validate(input)
                .map_err(|errors| errors.map(|e| e.to_string()).collect()),
        )
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.workers.values().map(|w| w.descriptor.clone()).collect()
    }

    /// catalogue JSON（name / description / input_schema），拼入 planner prompt
    pub fn to_catalogue_json(&self) -> String {
        serde_json::to_string_pretty(&self.descriptors()).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
