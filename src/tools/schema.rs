//! JSON Schema 辅助：schemars 生成的结构化输出 schema，以及日志用的输入预览

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 返回类型 T 的 JSON Schema（title 为类型名），作为生成请求的 schema 参数
pub fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null)
}

/// schema 的 title 字段；生成提供方据此区分规划与评审请求
pub fn schema_title(schema: &Value) -> Option<&str> {
    schema.get("title").and_then(Value::as_str)
}

/// 截断后的 JSON 文本，用于审计日志
pub fn preview(value: &Value, max_chars: usize) -> String {
    let s = value.to_string();
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s
    }
}
