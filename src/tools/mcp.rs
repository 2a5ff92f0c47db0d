//! 外部（MCP）工具适配
//!
//! MCP 服务进程的生命周期不在此处管理：调用方提供一个已连接的 `McpSession`，
//! 这里把它暴露的每个工具包装成普通的 Tool，按原名注册进同一张表（重名按注册表规则处理）。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, ApprovalSubject, PermissionKind};
use crate::tools::{Registration, Tool, ToolContext, ToolOutput, ToolRegistry};

/// MCP 服务端声明的工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// tools/call 返回的内容块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpContent {
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl McpCallResult {
    /// 拼接文本块；非文本块以占位符表示
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                McpContent::Text { text } => text.as_str(),
                McpContent::Unsupported => "[unsupported content]",
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 已连接的 MCP 会话
#[async_trait]
pub trait McpSession: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, String>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallResult, String>;
}

/// 单个 MCP 工具；外部工具副作用未知，默认需要审批
pub struct McpTool {
    info: McpToolInfo,
    description: String,
    session: Arc<dyn McpSession>,
    requires_approval: bool,
}

impl McpTool {
    pub fn new(info: McpToolInfo, session: Arc<dyn McpSession>) -> Self {
        let description = info
            .description
            .clone()
            .unwrap_or_else(|| format!("MCP tool {} from {}", info.name, session.server_name()));
        Self {
            info,
            description,
            session,
            requires_approval: true,
        }
    }

    /// 标记为只读，跳过审批
    pub fn trusted(mut self) -> Self {
        self.requires_approval = false;
        self
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    fn permission_kind(&self) -> PermissionKind {
        PermissionKind::External
    }

    fn approval_subject(&self, args: &Value) -> ApprovalSubject {
        ApprovalSubject::describe(format!(
            "Call {} on MCP server {} with {}",
            self.info.name,
            self.session.server_name(),
            args
        ))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let call = self.session.call_tool(&self.info.name, args);
        let result = tokio::select! {
            res = call => res?,
            _ = ctx.cancel.cancelled() => return Err("MCP call cancelled".to_string()),
        };
        let text = result.text();
        if result.is_error {
            return Err(text);
        }
        Ok(ToolOutput::new(
            format!("{}/{}", self.session.server_name(), self.info.name),
            text,
        ))
    }
}

/// 列出会话的全部工具并注册；返回每个工具的注册结果
///
/// schema 非法的工具记 warn 后跳过，不影响同一会话的其它工具。
pub async fn register_session(
    registry: &mut ToolRegistry,
    session: Arc<dyn McpSession>,
) -> Result<Vec<(String, Registration)>, AgentError> {
    let server = session.server_name().to_string();
    let infos = session
        .list_tools()
        .await
        .map_err(|e| AgentError::Config(format!("MCP server {server}: {e}")))?;
    let mut outcomes = Vec::with_capacity(infos.len());
    for info in infos {
        let name = info.name.clone();
        let tool = Arc::new(McpTool::new(info, session.clone()));
        match registry.register_mcp(server.clone(), tool) {
            Ok(outcome) => outcomes.push((name, outcome)),
            Err(e) => tracing::warn!(server = %server, tool = %name, error = %e, "MCP tool skipped"),
        }
    }
    tracing::info!(server = %server, tools = outcomes.len(), "MCP tools registered");
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RollbackJournal;
    use crate::engine::ChatMode;
    use crate::tools::{ReadFileTool, SafeFs, ToolSource};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct FakeSession;

    #[async_trait]
    impl McpSession for FakeSession {
        fn server_name(&self) -> &str {
            "fake"
        }

        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, String> {
            Ok(serde_json::from_value(json!([
                {"name": "lookup", "description": "Look up a key",
                 "inputSchema": {"type": "object", "properties": {"key": {"type": "string"}}, "required": ["key"]}},
                {"name": "read_file"}
            ]))
            .unwrap())
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallResult, String> {
            match args.get("key").and_then(|v| v.as_str()) {
                Some("missing") => Ok(McpCallResult {
                    content: vec![McpContent::Text { text: "no such key".into() }],
                    is_error: true,
                }),
                Some(key) => Ok(McpCallResult {
                    content: vec![McpContent::Text { text: format!("{name}:{key}") }],
                    is_error: false,
                }),
                None => Err("bad args".into()),
            }
        }
    }

    #[tokio::test]
    async fn test_register_session_respects_builtins() {
        let mut registry = ToolRegistry::new();
        registry.register(ReadFileTool).unwrap();
        let outcomes = register_session(&mut registry, Arc::new(FakeSession)).await.unwrap();
        assert_eq!(outcomes[0], ("lookup".to_string(), Registration::Added));
        assert_eq!(
            outcomes[1],
            ("read_file".to_string(), Registration::Shadowed { existing: ToolSource::Builtin })
        );
        let def = registry.resolve("lookup").unwrap();
        assert_eq!(def.source(), &ToolSource::Mcp { server: "fake".into() });
        assert!(def.validate(&json!({})).is_err());
    }

    /// 第二个工具的 inputSchema 不是合法的 JSON Schema
    struct MixedSession;

    #[async_trait]
    impl McpSession for MixedSession {
        fn server_name(&self) -> &str {
            "mixed"
        }

        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, String> {
            Ok(serde_json::from_value(json!([
                {"name": "first"},
                {"name": "broken", "inputSchema": {"type": 12}},
                {"name": "last"}
            ]))
            .unwrap())
        }

        async fn call_tool(&self, _name: &str, _args: Value) -> Result<McpCallResult, String> {
            Err("unused".into())
        }
    }

    #[tokio::test]
    async fn test_register_session_skips_invalid_schema() {
        let mut registry = ToolRegistry::new();
        let outcomes = register_session(&mut registry, Arc::new(MixedSession)).await.unwrap();
        assert_eq!(
            outcomes,
            vec![
                ("first".to_string(), Registration::Added),
                ("last".to_string(), Registration::Added),
            ]
        );
        assert!(registry.contains("first"));
        assert!(registry.contains("last"));
        assert!(!registry.contains("broken"));
    }

    #[tokio::test]
    async fn test_trusted_tool_skips_approval() {
        let info = FakeSession.list_tools().await.unwrap().remove(0);
        let tool = McpTool::new(info, Arc::new(FakeSession));
        assert!(!tool.available_in(ChatMode::Plan));

        let tool = tool.trusted();
        assert!(!tool.requires_approval());
        assert!(tool.available_in(ChatMode::Plan));
        assert!(tool.available_in(ChatMode::Agent));
    }

    #[tokio::test]
    async fn test_call_maps_error_flag() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(
            "c1",
            SafeFs::new(dir.path()),
            Arc::new(RollbackJournal::new()),
            CancellationToken::new(),
        );
        let info = FakeSession.list_tools().await.unwrap().remove(0);
        let tool = McpTool::new(info, Arc::new(FakeSession));
        assert!(tool.requires_approval());

        let out = tool.execute(json!({"key": "k"}), &ctx).await.unwrap();
        assert_eq!(out.output, "lookup:k");
        assert_eq!(out.title, "fake/lookup");
        assert_eq!(tool.execute(json!({"key": "missing"}), &ctx).await.unwrap_err(), "no such key");
    }

    #[test]
    fn test_unknown_content_block() {
        let result: McpCallResult = serde_json::from_value(json!({
            "content": [{"type": "image", "data": "..."}, {"type": "text", "text": "ok"}]
        }))
        .unwrap();
        assert_eq!(result.text(), "[unsupported content]\nok");
        assert!(!result.is_error);
    }
}
