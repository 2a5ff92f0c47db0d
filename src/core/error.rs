//! Agent 错误类型
//!
//! 工具侧错误（未找到、参数非法、执行失败、超时、路径逃逸）最终都会被执行器转成失败的 ToolResult 回灌模型；
//! Provider 错误交给 RetryPolicy 分类，只有无法恢复的才会让运行以 `stop_reason=error` 结束。

use thiserror::Error;

use crate::llm::ProviderError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments for {tool}: {details}")]
    InvalidArguments { tool: String, details: String },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    /// 每次运行只允许一个权限处理器
    #[error("A permission handler is already registered for this run")]
    PermissionHandlerAlreadyRegistered,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// 是否属于「工具侧」错误：这类错误只会变成失败的 ToolResult，不会终止运行
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            AgentError::ToolNotFound(_)
                | AgentError::InvalidArguments { .. }
                | AgentError::ToolExecutionFailed(_)
                | AgentError::ToolTimeout(_)
                | AgentError::PathEscape(_)
        )
    }
}
