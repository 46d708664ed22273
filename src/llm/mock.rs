//! Mock 生成提供方（用于测试与本地运行，无需 API）
//!
//! - ScriptedGenerator：按顺序返回预先编排的结果（含失败），并记录收到的 prompt
//! - MockGenerator：规划时先把请求委托给 echo worker，之后宣告完成；评审时总是判定完成

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{Generation, GenerationProvider, ProviderError};
use crate::tools::schema_title;

/// 按脚本回放的生成提供方
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Generation, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条结构化响应
    pub fn then_json(self, value: Value) -> Self {
        self.push(Ok(Generation::Structured(value)))
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.push(Ok(Generation::Text(text.into())))
    }

    pub fn then_err(self, err: ProviderError) -> Self {
        self.push(Err(err))
    }

    fn push(self, item: Result<Generation, ProviderError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
        self
    }

    /// 已收到的调用次数
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _schema: Option<&Value>,
    ) -> Result<Generation, ProviderError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::InvalidResponse("script exhausted".to_string())))
    }
}

/// 离线 Mock：委托一次 echo 后完成
#[derive(Debug, Default)]
pub struct MockGenerator;

fn line_value<'a>(prompt: &'a str, key: &str) -> Option<&'a str> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .map(str::trim)
}


#[async_trait]
impl GenerationProvider for MockGenerator {
    async fn generate(
        &self,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<Generation, ProviderError> {
        let request = line_value(prompt, "Request:").unwrap_or("(no input)");
        let value = match schema.and_then(schema_title).unwrap_or("") {
            "ReviewVerdict" => json!({
                "is_complete": true,
                "memory_summary": format!("Handled request: {request}"),
                "feedback": null,
            }),
            _ => {
                let completed: usize = line_value(prompt, "Completed calls:")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if completed == 0 {
                    json!({
                        "plan": "Echo the request back",
                        "calls": [{
                            "worker": "echo",
                            "input": { "text": format!("Echo from Mock: {request}") }
                        }],
                        "complete": false,
                        "feedback": null,
                    })
                } else {
                    json!({
                        "plan": null,
                        "calls": [],
                        "complete": true,
                        "feedback": "Request handled",
                    })
                }
            }
        };
        Ok(Generation::Structured(value))
    }
}
