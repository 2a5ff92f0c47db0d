//! 工具参数 JSON Schema：schemars 从参数结构体生成，jsonschema 编译后在派发前校验

use jsonschema::Validator;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::AgentError;

/// 从参数类型生成 schema；去掉 `$schema`，Provider 不需要
pub fn schema_of<T: JsonSchema>() -> Value {
    let mut v = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
    if let Some(obj) = v.as_object_mut() {
        obj.remove("$schema");
    }
    v
}

/// 编译 schema；schema 本身非法时返回 Config 错误（注册阶段即暴露）
pub fn compile(tool: &str, schema: &Value) -> Result<Validator, AgentError> {
    jsonschema::validator_for(schema)
        .map_err(|e| AgentError::Config(format!("invalid schema for tool {tool}: {e}")))
}

/// 用编译好的 schema 校验参数，汇总全部违规项
pub fn check(tool: &str, validator: &Validator, args: &Value) -> Result<(), AgentError> {
    if validator.is_valid(args) {
        return Ok(());
    }
    let details = validator
        .iter_errors(args)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Err(AgentError::InvalidArguments {
        tool: tool.to_string(),
        details,
    })
}

/// 校验通过后把参数反序列化成工具自己的类型
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))
}
