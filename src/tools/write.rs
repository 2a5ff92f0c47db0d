//! 修改文件的工具：write_file / delete_file
//!
//! 需要审批；修改前先向回滚日志追加条目（操作前的内容，或「原本不存在」），恢复 prior 是幂等的，失败的写入留下的条目无害。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ApprovalSubject, PermissionKind, PriorState, RollbackEntry, RollbackKind};
use crate::tools::filesystem::read_existing;
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

fn path_arg(args: &Value) -> String {
    args.get("path")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteFileArgs {
    /// 相对工作区的文件路径；父目录不存在时自动创建
    path: String,
    /// 完整的新内容
    content: String,
}

/// write_file：整体写入（新建或覆盖）
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file inside the workspace with the given content. Parent directories are created as needed."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WriteFileArgs>()
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn permission_kind(&self) -> PermissionKind {
        PermissionKind::FileWrite
    }

    fn approval_subject(&self, args: &Value) -> ApprovalSubject {
        let path = path_arg(args);
        ApprovalSubject::describe(format!("Write file {path}")).with_path(path)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: WriteFileArgs = parse_args(args)?;
        let path = ctx.fs.resolve_new(&args.path).map_err(|e| e.to_string())?;
        if path.is_dir() {
            return Err(format!("{} is a directory", args.path));
        }

        let prior = read_existing(&path).await?;
        let (kind, prior, verb) = match prior {
            Some(bytes) => (RollbackKind::Write, PriorState::Content(bytes), "Overwrote"),
            None => (RollbackKind::Create, PriorState::Absent, "Created"),
        };

        // 从记录到写入之间没有 await：超时取消只会发生在记录之前
        ctx.record(RollbackEntry::new(&ctx.call_id, kind, &path, prior));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        std::fs::write(&path, args.content.as_bytes()).map_err(|e| format!("Write failed: {e}"))?;

        let shown = ctx.fs.display(&path);
        Ok(ToolOutput::new(
            shown.clone(),
            format!("{verb} {shown} ({} bytes)", args.content.len()),
        ))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DeleteFileArgs {
    /// 要删除的文件
    path: String,
}

/// delete_file：删除单个文件（不删除目录）
pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file inside the workspace. Directories are not removed."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<DeleteFileArgs>()
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn permission_kind(&self) -> PermissionKind {
        PermissionKind::FileDelete
    }

    fn approval_subject(&self, args: &Value) -> ApprovalSubject {
        let path = path_arg(args);
        ApprovalSubject::describe(format!("Delete file {path}")).with_path(path)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: DeleteFileArgs = parse_args(args)?;
        let path = ctx.fs.resolve(&args.path).map_err(|e| e.to_string())?;
        if path.is_dir() {
            return Err(format!("{} is a directory", args.path));
        }
        let prior = read_existing(&path)
            .await?
            .ok_or_else(|| format!("Path not found: {}", args.path))?;
        ctx.record(RollbackEntry::new(
            &ctx.call_id,
            RollbackKind::Delete,
            &path,
            PriorState::Content(prior),
        ));
        std::fs::remove_file(&path).map_err(|e| format!("Delete failed: {e}"))?;

        let shown = ctx.fs.display(&path);
        Ok(ToolOutput::new(shown.clone(), format!("Deleted {shown}")))
    }
}
