//! 工具执行器
//!
//! prepare：按名解析 + 模式可用性 + schema 校验；run：在超时内执行并捕获 panic。
//! 两步都不抛错，一切失败都变成 `success=false` 的 ToolResult 回灌模型；每次执行输出一条结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::engine::ChatMode;
use crate::tools::{ToolCall, ToolContext, ToolDefinition, ToolRegistry, ToolResult};

/// 工具执行器：对每次调用施加超时
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 解析并校验；失败时给出可直接回灌的 ToolResult
    pub fn prepare(&self, call: &ToolCall, mode: ChatMode) -> Result<Arc<ToolDefinition>, ToolResult> {
        let reject = |err: AgentError| {
            tracing::warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call rejected");
            ToolResult::failed(&call.id, &call.name, err.to_string())
        };
        let def = self.registry.resolve(&call.name).map_err(reject)?;
        if !def.tool().available_in(mode) {
            return Err(reject(AgentError::ToolExecutionFailed(format!(
                "tool {} is not available in {} mode",
                call.name,
                mode.as_str()
            ))));
        }
        def.validate(&call.arguments).map_err(reject)?;
        Ok(def)
    }

    /// 执行已校验的调用；超时返回 ToolTimeout，panic 与 Err 转为 ToolExecutionFailed
    pub async fn run(&self, def: &ToolDefinition, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let start = Instant::now();
        let fut = AssertUnwindSafe(def.tool().execute(call.arguments.clone(), ctx)).catch_unwind();
        let result = timeout(self.timeout, fut).await;

        let (outcome, tool_result) = match result {
            Ok(Ok(Ok(out))) => ("ok", ToolResult::ok(&call.id, out.title, out.output)),
            Ok(Ok(Err(e))) => (
                "error",
                ToolResult::failed(&call.id, &call.name, AgentError::ToolExecutionFailed(e).to_string()),
            ),
            Ok(Err(panic)) => (
                "panic",
                ToolResult::failed(
                    &call.id,
                    &call.name,
                    AgentError::ToolExecutionFailed(panic_message(panic.as_ref())).to_string(),
                ),
            ),
            Err(_) => (
                "timeout",
                ToolResult::failed(
                    &call.id,
                    &call.name,
                    AgentError::ToolTimeout(format!("{} after {}s", call.name, self.timeout.as_secs())).to_string(),
                ),
            ),
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": tool_result.success,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        tool_result
    }

    /// prepare + run
    pub async fn execute(&self, call: &ToolCall, mode: ChatMode, ctx: &ToolContext) -> ToolResult {
        match self.prepare(call, mode) {
            Ok(def) => self.run(&def, call, ctx).await,
            Err(rejected) => rejected,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("tool panicked: {detail}")
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
