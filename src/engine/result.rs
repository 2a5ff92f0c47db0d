//! 运行结果：AgentResult 是一次运行唯一的对外输出

use serde::Serialize;

use crate::core::{ExecutionState, RollbackReport};
use crate::tools::{ToolCall, ToolResult};

/// 终止原因；每次运行恰好设置一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    MaxIterations,
    ConsecutiveErrors,
    Aborted,
    Error,
    PlanApproval,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::MaxIterations => "max_iterations",
            StopReason::ConsecutiveErrors => "consecutive_errors",
            StopReason::Aborted => "aborted",
            StopReason::Error => "error",
            StopReason::PlanApproval => "plan_approval",
        }
    }

    /// 只有正常完成与计划提交算成功
    pub fn is_success(self) -> bool {
        matches!(self, StopReason::Completed | StopReason::PlanApproval)
    }
}

/// 一次工具调用及其结果
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub call: ToolCall,
    pub result: ToolResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentResult {
    pub success: bool,
    pub final_response: String,
    pub iterations: usize,
    pub tool_calls: Vec<ToolCallRecord>,
    pub stop_reason: StopReason,
    /// 运行结束时控制器的状态：正常结束为 running，中止为 stopped
    pub final_state: ExecutionState,
    /// 中止并回滚时的回放结果
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
