//! 沙箱文件系统与只读文件工具
//!
//! SafeFs 绑定工作区根目录，所有路径经 resolve / resolve_new 校验必须在根下（禁止 ../ 与符号链接逃逸）；
//! read_file / list_dir 基于 SafeFs 提供只读能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::core::AgentError;
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// 单文件读取上限
pub const MAX_READ_BYTES: u64 = 1024 * 1024;

/// 遍历时跳过的目录
pub(crate) const SKIP_DIRS: &[&str] = &["target", "node_modules", ".git"];

/// 沙箱文件系统：绑定根目录，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析已存在的路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let full = self.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {path}")))?;
        self.confine(path, canonical)
    }

    /// 解析可能尚不存在的路径（写入、新建）：先做词法归一化，再规范化最近的已存在祖先
    pub fn resolve_new(&self, path: &str) -> Result<PathBuf, AgentError> {
        let mut normalized = PathBuf::new();
        for component in self.join(path).components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(AgentError::PathEscape(path.to_string()));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }

        let mut existing = normalized.as_path();
        let mut rest = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    rest.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Err(AgentError::PathEscape(path.to_string())),
            }
        }
        let mut resolved = existing.canonicalize()?;
        for name in rest.iter().rev() {
            resolved.push(name);
        }
        self.confine(path, resolved)
    }

    /// 相对根目录的展示路径
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn join(&self, path: &str) -> PathBuf {
        let trimmed = path.trim();
        if trimmed.is_empty() || trimmed == "." {
            return self.root_dir.clone();
        }
        self.root_dir.join(trimmed.trim_start_matches("./"))
    }

    fn confine(&self, raw: &str, resolved: PathBuf) -> Result<PathBuf, AgentError> {
        if resolved.starts_with(&self.root_dir) {
            Ok(resolved)
        } else {
            Err(AgentError::PathEscape(raw.to_string())) // 如 ../../etc/passwd
        }
    }
}

/// 读取文件；文件不存在时返回 None
pub(crate) async fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(format!("Read failed: {e}")),
    }
}

pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// 相对工作区的文件路径
    path: String,
    /// 起始行（从 1 开始）
    #[serde(default)]
    offset: Option<usize>,
    /// 最多返回的行数
    #[serde(default)]
    limit: Option<usize>,
}

/// read_file：读取文本文件，可按行截取
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file inside the workspace. Optional offset (1-based line) and limit (number of lines)."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ReadFileArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: ReadFileArgs = parse_args(args)?;
        let path = ctx.fs.resolve(&args.path).map_err(|e| e.to_string())?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;
        if meta.is_dir() {
            return Err(format!("{} is a directory", args.path));
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(format!(
                "{} is too large ({} bytes, limit {MAX_READ_BYTES})",
                args.path,
                meta.len()
            ));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;

        let output = match (args.offset, args.limit) {
            (None, None) => content,
            (offset, limit) => {
                let skip = offset.unwrap_or(1).saturating_sub(1);
                content
                    .lines()
                    .skip(skip)
                    .take(limit.unwrap_or(usize::MAX))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        Ok(ToolOutput::new(ctx.fs.display(&path), output))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListDirArgs {
    /// 目录路径，默认工作区根
    #[serde(default)]
    path: Option<String>,
    /// 递归列出（最多 3 层）
    #[serde(default)]
    recursive: bool,
}

/// list_dir：列出目录，目录名带 `/` 后缀，跳过隐藏项
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory inside the workspace. Directories end with '/'. Set recursive=true to descend up to 3 levels."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ListDirArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: ListDirArgs = parse_args(args)?;
        let raw = args.path.unwrap_or_else(|| ".".to_string());
        let base = ctx.fs.resolve(&raw).map_err(|e| e.to_string())?;
        if !base.is_dir() {
            return Err(format!("{raw} is not a directory"));
        }
        let depth = if args.recursive { 3 } else { 1 };

        let mut entries = Vec::new();
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !is_hidden(&name) && !(e.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
            });
        for entry in walker.filter_map(|e| e.ok()) {
            let rel = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{rel}{suffix}"));
        }
        Ok(ToolOutput::new(ctx.fs.display(&base), entries.join("\n")))
    }
}
