//! submit_plan：规划模式专用，提交计划后运行以 plan_approval 结束

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::ChatMode;
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

pub const SUBMIT_PLAN: &str = "submit_plan";

#[derive(Debug, Deserialize, JsonSchema)]
struct SubmitPlanArgs {
    /// 完整的执行计划（Markdown）
    plan: String,
}

pub struct SubmitPlanTool;

#[async_trait]
impl Tool for SubmitPlanTool {
    fn name(&self) -> &str {
        SUBMIT_PLAN
    }

    fn description(&self) -> &str {
        "Submit the final implementation plan for user approval. Call this once the plan is complete; it ends the planning session."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SubmitPlanArgs>()
    }

    fn available_in(&self, mode: ChatMode) -> bool {
        mode == ChatMode::Plan
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: SubmitPlanArgs = parse_args(args)?;
        let plan = args.plan.trim();
        if plan.is_empty() {
            return Err("plan must not be empty".to_string());
        }
        Ok(ToolOutput::new("plan", plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RollbackJournal;
    use crate::tools::SafeFs;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_submit_plan() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(
            "c1",
            SafeFs::new(dir.path()),
            Arc::new(RollbackJournal::new()),
            CancellationToken::new(),
        );
        let out = SubmitPlanTool
            .execute(json!({"plan": "  1. read\n2. write  "}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.output, "1. read\n2. write");
        assert!(SubmitPlanTool.execute(json!({"plan": " "}), &ctx).await.is_err());
        assert!(!SubmitPlanTool.available_in(ChatMode::Agent));
        assert!(SubmitPlanTool.available_in(ChatMode::Plan));
    }
}
