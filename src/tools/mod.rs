//! 工具层：Tool trait、注册表、执行器、沙箱文件系统与内置工具

pub mod edit;
pub mod executor;
pub mod filesystem;
pub mod mcp;
pub mod plan;
pub mod registry;
pub mod schema;
pub mod search;
pub mod shell;
pub mod types;
pub mod write;

pub use edit::EditFileTool;
pub use executor::ToolExecutor;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs};
pub use mcp::{register_session, McpCallResult, McpContent, McpSession, McpTool, McpToolInfo};
pub use plan::{SubmitPlanTool, SUBMIT_PLAN};
pub use registry::{Registration, Tool, ToolDefinition, ToolRegistry, ToolSource};
pub use search::{GlobTool, GrepTool};
pub use shell::ShellTool;
pub use types::{ToolCall, ToolContext, ToolOutput, ToolResult, ToolSpec};
pub use write::{DeleteFileTool, WriteFileTool};

/// 注册全部内置工具（内置工具先于外部工具注册）
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    shell_allowed: Vec<String>,
    shell_timeout_secs: u64,
) -> Result<(), crate::core::AgentError> {
    registry.register(ReadFileTool)?;
    registry.register(ListDirTool)?;
    registry.register(GlobTool)?;
    registry.register(GrepTool)?;
    registry.register(WriteFileTool)?;
    registry.register(EditFileTool)?;
    registry.register(DeleteFileTool)?;
    registry.register(ShellTool::new(shell_allowed, shell_timeout_secs))?;
    registry.register(SubmitPlanTool)?;
    Ok(())
}
