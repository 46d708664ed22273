//! Echo worker（演示与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Worker;

/// 回显 `text` 字段
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Input: {\"text\": \"message\"}"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn invoke(&self, input: Value) -> Result<Value, String> {
        let text = input
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(serde_json::json!({ "text": text }))
    }
}
