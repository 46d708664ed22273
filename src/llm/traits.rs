//! 生成提供方抽象
//!
//! 所有生成后端实现 GenerationProvider：generate(prompt, schema?) 返回结构化 JSON 或纯文本。
//! 具体模型与其线协议不在本 crate 范围内。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// 生成/相似度提供方错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Provider timeout")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 一次生成的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    /// 提供了 schema 且后端支持结构化输出
    Structured(Value),
    Text(String),
}

impl Generation {
    /// 统一取出 JSON：结构化直接返回；文本则提取其中的 JSON 块
    pub fn into_json(self) -> Result<Value, ProviderError> {
        match self {
            Generation::Structured(value) => Ok(value),
            Generation::Text(text) => {
                let block = extract_json_block(&text).ok_or_else(|| {
                    ProviderError::InvalidResponse(format!("no JSON object in: {}", preview(&text)))
                })?;
                serde_json::from_str(block)
                    .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {}", preview(block))))
            }
        }
    }
}

/// 生成提供方 trait
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// schema 为期望输出的 JSON Schema；None 表示自由文本
    async fn generate(
        &self,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<Generation, ProviderError>;
}

/// 从文本中提取 JSON 块（```json ... ``` 或最外层 {...}）
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_block() {
        let text = "Sure.\n```json\n{\"complete\": true}\n```\nbye";
        assert_eq!(extract_json_block(text), Some("{\"complete\": true}"));
    }

    #[test]
    fn test_extract_bare_object() {
        let text = "decision: {\"a\": {\"b\": 1}} done";
        assert_eq!(extract_json_block(text), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn test_text_without_json_is_invalid() {
        let err = Generation::Text("no braces here".to_string()).into_json().unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[test]
    fn test_structured_passthrough() {
        let value = serde_json::json!({"x": 1});
        assert_eq!(Generation::Structured(value.clone()).into_json().unwrap(), value);
    }
}
