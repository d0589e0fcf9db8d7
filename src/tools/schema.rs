//! 参数 JSON Schema 生成（schemars）
//!
//! 内置工具的 ToolDefinition.parameters 与 oracle 提示词里的输出格式都由这里生成。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 类型 T 的 JSON Schema；序列化失败时返回 Null
pub fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null)
}

/// 格式化后的 Schema 文本，可拼入提示词
pub fn schema_json<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}
