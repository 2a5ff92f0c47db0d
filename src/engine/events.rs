//! 运行过程观察
//!
//! AgentObserver 在固定节点被同步调用，只用于展示，不影响控制流；
//! ChannelObserver 把事件转成可序列化的 AgentEvent 发给前端。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::tools::{ToolCall, ToolResult};

/// 观察者：全部方法默认空实现
pub trait AgentObserver: Send + Sync {
    /// 第 iteration 轮开始（从 1 开始）
    fn on_iteration(&self, _iteration: usize, _max_iterations: usize) {}

    /// 模型文本（流式时为增量片段）
    fn on_text(&self, _text: &str) {}

    fn on_thinking(&self, _text: &str) {}

    fn on_tool_call(&self, _call: &ToolCall) {}

    fn on_tool_result(&self, _call: &ToolCall, _result: &ToolResult) {}

    /// 可恢复的问题：重试、切换提供方、工具失败等
    fn on_warning(&self, _message: &str) {}

    /// 使运行终止的错误
    fn on_error(&self, _message: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AgentObserver for NoopObserver {}

/// 把事件写进 tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AgentObserver for TracingObserver {
    fn on_iteration(&self, iteration: usize, max_iterations: usize) {
        tracing::debug!(iteration, max_iterations, "iteration");
    }

    fn on_text(&self, text: &str) {
        tracing::debug!(len = text.len(), "model text");
    }

    fn on_thinking(&self, text: &str) {
        tracing::trace!(thinking = %text, "model thinking");
    }

    fn on_tool_call(&self, call: &ToolCall) {
        tracing::info!(tool = %call.name, call_id = %call.id, "tool call");
    }

    fn on_tool_result(&self, call: &ToolCall, result: &ToolResult) {
        if result.success {
            tracing::info!(tool = %call.name, title = %result.title, "tool succeeded");
        } else {
            tracing::warn!(tool = %call.name, error = ?result.error, "tool failed");
        }
    }

    fn on_warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn on_error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// 单条过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Iteration { iteration: usize, max_iterations: usize },
    Text { text: String },
    Thinking { text: String },
    ToolCall { id: String, tool: String, args: serde_json::Value },
    /// 工具返回（预览，避免过长）
    ToolResult { id: String, tool: String, success: bool, preview: String },
    Warning { text: String },
    Error { text: String },
}

const PREVIEW_CHARS: usize = 500;

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 通过无界通道转发事件；接收端关闭后静默丢弃
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

impl AgentObserver for ChannelObserver {
    fn on_iteration(&self, iteration: usize, max_iterations: usize) {
        self.emit(AgentEvent::Iteration {
            iteration,
            max_iterations,
        });
    }

    fn on_text(&self, text: &str) {
        self.emit(AgentEvent::Text { text: text.to_string() });
    }

    fn on_thinking(&self, text: &str) {
        self.emit(AgentEvent::Thinking { text: text.to_string() });
    }

    fn on_tool_call(&self, call: &ToolCall) {
        self.emit(AgentEvent::ToolCall {
            id: call.id.clone(),
            tool: call.name.clone(),
            args: call.arguments.clone(),
        });
    }

    fn on_tool_result(&self, call: &ToolCall, result: &ToolResult) {
        self.emit(AgentEvent::ToolResult {
            id: call.id.clone(),
            tool: call.name.clone(),
            success: result.success,
            preview: preview(&result.to_model_content()),
        });
    }

    fn on_warning(&self, message: &str) {
        self.emit(AgentEvent::Warning { text: message.to_string() });
    }

    fn on_error(&self, message: &str) {
        self.emit(AgentEvent::Error { text: message.to_string() });
    }
}
