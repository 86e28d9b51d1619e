//! 能力参数 JSON Schema 生成与类型化参数解析
//!
//! schema 由参数结构体经 schemars 生成，既供 oracle 理解参数格式，也与实际反序列化规则一致。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::CapabilityError;

/// 参数结构体的 JSON Schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 按参数类型反序列化；失败即 InvalidArguments（发生在任何副作用之前）
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, CapabilityError> {
    // 无参数能力允许 null
    let args = if args.is_null() { serde_json::json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| CapabilityError::InvalidArguments(e.to_string()))
}
