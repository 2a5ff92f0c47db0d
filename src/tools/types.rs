//! 工具调用的数据结构：ToolCall / ToolResult / ToolSpec 与执行上下文

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{RollbackEntry, RollbackJournal};
use crate::tools::SafeFs;

/// 模型请求的一次工具调用；id 在同一轮内唯一，用于关联 ToolResult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 未经类型化的参数，派发时按工具 schema 校验
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 工具执行结果；失败时 error 作为工具输出回灌模型，而不是抛出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    pub title: String,
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            title: title.into(),
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(call_id: impl Into<String>, title: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            title: title.into(),
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// 回灌模型的文本
    pub fn to_model_content(&self) -> String {
        match &self.error {
            Some(e) if !self.success => format!("Error: {e}"),
            _ => self.output.clone(),
        }
    }
}

/// 工具成功时的产出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub title: String,
    pub output: String,
}

impl ToolOutput {
    pub fn new(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
        }
    }
}

/// 发给模型的工具声明
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单次工具执行的上下文：工作区、回滚日志、取消令牌
#[derive(Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub fs: SafeFs,
    pub journal: Arc<RollbackJournal>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(
        call_id: impl Into<String>,
        fs: SafeFs,
        journal: Arc<RollbackJournal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            fs,
            journal,
            cancel,
        }
    }

    /// 修改文件的工具在成功后调用
    pub fn record(&self, entry: RollbackEntry) {
        self.journal.record(entry);
    }
}
