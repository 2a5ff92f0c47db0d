//! edit_file：精确字符串替换
//!
//! old_string 必须在文件中出现；出现多次时需 replace_all=true，否则报错让模型补充上下文。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ApprovalSubject, PermissionKind, PriorState, RollbackEntry, RollbackKind};
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
struct EditFileArgs {
    /// 相对工作区的文件路径
    path: String,
    /// 要被替换的原文（须完全一致）
    old_string: String,
    new_string: String,
    /// 替换全部出现
    #[serde(default)]
    replace_all: bool,
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a workspace file. old_string must match exactly and be unique unless replace_all=true."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EditFileArgs>()
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn permission_kind(&self) -> PermissionKind {
        PermissionKind::FileWrite
    }

    fn approval_subject(&self, args: &Value) -> ApprovalSubject {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        ApprovalSubject::describe(format!("Edit file {path}")).with_path(path)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: EditFileArgs = parse_args(args)?;
        if args.old_string.is_empty() {
            return Err("old_string must not be empty".to_string());
        }
        if args.old_string == args.new_string {
            return Err("old_string and new_string are identical".to_string());
        }

        let path = ctx.fs.resolve(&args.path).map_err(|e| e.to_string())?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;

        let count = content.matches(args.old_string.as_str()).count();
        let updated = match count {
            0 => return Err(format!("old_string not found in {}", args.path)),
            1 => content.replacen(&args.old_string, &args.new_string, 1),
            _ if args.replace_all => content.replace(&args.old_string, &args.new_string),
            n => {
                return Err(format!(
                    "old_string occurs {n} times in {}; add context or set replace_all",
                    args.path
                ))
            }
        };

        ctx.record(RollbackEntry::new(
            &ctx.call_id,
            RollbackKind::Edit,
            &path,
            PriorState::Content(content.into_bytes()),
        ));
        std::fs::write(&path, updated.as_bytes()).map_err(|e| format!("Write failed: {e}"))?;

        let shown = ctx.fs.display(&path);
        Ok(ToolOutput::new(
            shown.clone(),
            format!("Edited {shown}: {count} replacement(s)"),
        ))
    }
}
