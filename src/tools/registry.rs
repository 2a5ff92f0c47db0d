//! 工具注册表
//!
//! 所有工具实现 Tool trait，由 ToolRegistry 按名注册与查找；内置工具与 MCP 工具共用同一张 name -> definition 表。
//!
//! 重名规则（确定性）：
//! - 内置工具先注册；之后任何同名注册都会被拒绝（`Registration::Shadowed`）并记一条 warn
//! - 只有 `register_override` 会替换已有条目，且保持原来的位置
//! - `specs()` / `tool_names()` 按注册顺序输出

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use jsonschema::Validator;
use serde_json::Value;

use crate::core::{AgentError, ApprovalSubject, PermissionKind};
use crate::engine::ChatMode;
use crate::tools::schema;
use crate::tools::{ToolContext, ToolOutput, ToolSpec};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、审批声明、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称，模型按此名调用
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；派发前据此校验
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    /// 有副作用的工具返回 true，执行前需经 PermissionGate
    fn requires_approval(&self) -> bool {
        false
    }

    fn permission_kind(&self) -> PermissionKind {
        PermissionKind::Other
    }

    /// 供权限请求展示的描述
    fn approval_subject(&self, _args: &Value) -> ApprovalSubject {
        ApprovalSubject::describe(format!("Run tool {}", self.name()))
    }

    /// 该模式下是否向模型暴露
    fn available_in(&self, mode: ChatMode) -> bool {
        match mode {
            ChatMode::Agent => true,
            ChatMode::Plan => !self.requires_approval(),
        }
    }

    /// 执行；Err 为给模型看的错误文本
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String>;
}

/// 工具来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    Mcp { server: String },
}

/// 注册后的工具：实现 + 来源 + 编译好的参数校验器
pub struct ToolDefinition {
    tool: Arc<dyn Tool>,
    source: ToolSource,
    schema: Value,
    validator: Validator,
}

impl ToolDefinition {
    pub fn new(tool: Arc<dyn Tool>, source: ToolSource) -> Result<Self, AgentError> {
        let schema = tool.parameters_schema();
        let validator = schema::compile(tool.name(), &schema)?;
        Ok(Self {
            tool,
            source,
            schema,
            validator,
        })
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }

    pub fn source(&self) -> &ToolSource {
        &self.source
    }

    pub fn tool(&self) -> &Arc<dyn Tool> {
        &self.tool
    }

    pub fn validate(&self, args: &Value) -> Result<(), AgentError> {
        schema::check(self.name(), &self.validator, args)
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.tool.description().to_string(),
            parameters: self.schema.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name())
            .field("source", &self.source)
            .finish()
    }
}

/// 一次注册的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added,
    Replaced,
    /// 名称已被占用，新工具未生效
    Shadowed { existing: ToolSource },
}

/// 工具注册表：按注册顺序保存 name -> ToolDefinition
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置工具
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<Registration, AgentError> {
        self.insert(Arc::new(tool), ToolSource::Builtin, false)
    }

    /// 注册外部（MCP）工具；与已有工具重名时被拒绝
    pub fn register_mcp(
        &mut self,
        server: impl Into<String>,
        tool: Arc<dyn Tool>,
    ) -> Result<Registration, AgentError> {
        self.insert(tool, ToolSource::Mcp { server: server.into() }, false)
    }

    /// 显式覆盖：替换同名工具并保持其位置
    pub fn register_override(
        &mut self,
        tool: Arc<dyn Tool>,
        source: ToolSource,
    ) -> Result<Registration, AgentError> {
        self.insert(tool, source, true)
    }

    fn insert(
        &mut self,
        tool: Arc<dyn Tool>,
        source: ToolSource,
        replace: bool,
    ) -> Result<Registration, AgentError> {
        let def = ToolDefinition::new(tool, source)?;
        let name = def.name().to_string();
        match self.tools.get_mut(&name) {
            Some(existing) if !replace => {
                tracing::warn!(tool = %name, existing = ?existing.source(), rejected = ?def.source(), "tool name already registered, ignoring");
                Ok(Registration::Shadowed {
                    existing: existing.source().clone(),
                })
            }
            Some(existing) => {
                tracing::info!(tool = %name, source = ?def.source(), "tool overridden");
                *existing = Arc::new(def);
                Ok(Registration::Replaced)
            }
            None => {
                self.tools.insert(name, Arc::new(def));
                Ok(Registration::Added)
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ToolDefinition>, AgentError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 该模式下暴露给模型的工具声明
    pub fn specs(&self, mode: ChatMode) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|def| def.tool().available_in(mode))
            .map(|def| def.spec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Named {
        name: &'static str,
        description: &'static str,
        gated: bool,
    }

    impl Named {
        fn new(name: &'static str, description: &'static str) -> Self {
            Self {
                name,
                description,
                gated: false,
            }
        }
    }

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            self.description
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })
        }

        fn requires_approval(&self) -> bool {
            self.gated
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
            Ok(ToolOutput::new(self.name, self.description))
        }
    }

    #[test]
    fn test_resolve_and_not_found() {
        let mut reg = ToolRegistry::new();
        assert_eq!(reg.register(Named::new("read_file", "builtin")).unwrap(), Registration::Added);
        assert!(reg.resolve("read_file").is_ok());
        assert!(matches!(reg.resolve("nope"), Err(AgentError::ToolNotFound(n)) if n == "nope"));
    }

    #[test]
    fn test_mcp_collision_is_shadowed() {
        let mut reg = ToolRegistry::new();
        reg.register(Named::new("read_file", "builtin")).unwrap();
        let outcome = reg
            .register_mcp("files", Arc::new(Named::new("read_file", "external")))
            .unwrap();
        assert_eq!(outcome, Registration::Shadowed { existing: ToolSource::Builtin });
        let def = reg.resolve("read_file").unwrap();
        assert_eq!(def.spec().description, "builtin");
    }

    #[test]
    fn test_override_keeps_position() {
        let mut reg = ToolRegistry::new();
        reg.register(Named::new("a", "first")).unwrap();
        reg.register(Named::new("b", "second")).unwrap();
        let outcome = reg
            .register_override(
                Arc::new(Named::new("a", "replaced")),
                ToolSource::Mcp { server: "s".into() },
            )
            .unwrap();
        assert_eq!(outcome, Registration::Replaced);
        assert_eq!(reg.tool_names(), vec!["a", "b"]);
        let specs = reg.specs(ChatMode::Agent);
        assert_eq!(specs[0].description, "replaced");
    }

    #[test]
    fn test_validate_uses_schema() {
        let mut reg = ToolRegistry::new();
        reg.register(Named::new("read_file", "builtin")).unwrap();
        let def = reg.resolve("read_file").unwrap();
        assert!(def.validate(&json!({"path": "x"})).is_ok());
        assert!(matches!(
            def.validate(&json!({})),
            Err(AgentError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_plan_mode_hides_gated_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(Named::new("read_file", "ro")).unwrap();
        reg.register(Named {
            gated: true,
            ..Named::new("write_file", "rw")
        })
        .unwrap();
        let names: Vec<_> = reg.specs(ChatMode::Plan).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["read_file"]);
        assert_eq!(reg.specs(ChatMode::Agent).len(), 2);
    }
}
