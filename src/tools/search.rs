//! 工作区检索：glob 按路径模式找文件，grep 按内容搜索
//!
//! 遍历在阻塞线程中进行，跳过隐藏目录与 target / node_modules，结果数有上限。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use walkdir::{DirEntry, WalkDir};

use crate::tools::filesystem::{is_hidden, MAX_READ_BYTES, SKIP_DIRS};
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

const MAX_DEPTH: usize = 10;
const MAX_RESULTS: usize = 200;
const MAX_MATCHES: usize = 50;

fn visible(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !is_hidden(&name) && !(entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
}

fn walk_files(base: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(base)
        .max_depth(MAX_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(visible)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
}

fn relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GlobArgs {
    /// 路径模式，如 `src/**/*.rs`
    pattern: String,
    /// 搜索起点，默认工作区根
    #[serde(default)]
    path: Option<String>,
}

/// glob：按路径模式列出文件
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files whose workspace-relative path matches a glob pattern such as \"src/**/*.rs\"."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<GlobArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: GlobArgs = parse_args(args)?;
        let pattern = glob::Pattern::new(&args.pattern)
            .map_err(|e| format!("Invalid glob pattern: {e}"))?;
        let raw = args.path.unwrap_or_else(|| ".".to_string());
        let base = ctx.fs.resolve(&raw).map_err(|e| e.to_string())?;

        let walk_base = base.clone();
        let files = tokio::task::spawn_blocking(move || {
            walk_files(&walk_base)
                .map(|e| relative(&walk_base, e.path()))
                .filter(|rel| pattern.matches(rel))
                .take(MAX_RESULTS)
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| format!("Search failed: {e}"))?;

        let output = if files.is_empty() {
            "No files found".to_string()
        } else {
            files.join("\n")
        };
        Ok(ToolOutput::new(format!("glob {}", args.pattern), output))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GrepArgs {
    /// 搜索模式；use_regex=true 时按正则解释
    pattern: String,
    /// 搜索起点，默认工作区根
    #[serde(default)]
    path: Option<String>,
    /// 文件名过滤，如 `*.rs`
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    use_regex: bool,
}

enum Matcher {
    Literal(String),
    Regex(regex::Regex),
}

impl Matcher {
    fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Literal(s) => line.contains(s.as_str()),
            Matcher::Regex(re) => re.is_match(line),
        }
    }
}

fn grep_files(base: &Path, matcher: &Matcher, include: Option<&glob::Pattern>) -> Vec<String> {
    let mut hits = Vec::new();
    for entry in walk_files(base) {
        if let Some(include) = include {
            let name = entry.file_name().to_string_lossy();
            if !include.matches(&name) {
                continue;
            }
        }
        if entry.metadata().map(|m| m.len() > MAX_READ_BYTES).unwrap_or(true) {
            continue;
        }
        // 非 UTF-8 文件直接跳过
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = relative(base, entry.path());
        for (idx, line) in content.lines().enumerate() {
            if matcher.is_match(line) {
                hits.push(format!("{rel}:{}: {}", idx + 1, line.trim_end()));
                if hits.len() >= MAX_MATCHES {
                    return hits;
                }
            }
        }
    }
    hits
}

/// grep：在工作区文件中搜索内容，输出 `path:line: text`
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents in the workspace. Plain substring by default, regex when use_regex=true. Optional include filter such as \"*.rs\"."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<GrepArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: GrepArgs = parse_args(args)?;
        let matcher = if args.use_regex {
            Matcher::Regex(
                regex::Regex::new(&args.pattern).map_err(|e| format!("Invalid regex pattern: {e}"))?,
            )
        } else {
            Matcher::Literal(args.pattern.clone())
        };
        let include = args
            .include
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| format!("Invalid include pattern: {e}"))?;
        let raw = args.path.unwrap_or_else(|| ".".to_string());
        let base: PathBuf = ctx.fs.resolve(&raw).map_err(|e| e.to_string())?;

        let hits = tokio::task::spawn_blocking(move || grep_files(&base, &matcher, include.as_ref()))
            .await
            .map_err(|e| format!("Search failed: {e}"))?;

        let output = if hits.is_empty() {
            "No matches".to_string()
        } else {
            hits.join("\n")
        };
        Ok(ToolOutput::new(format!("grep {}", args.pattern), output))
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

    fn workspace() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn run() {}\n// TODO later\n").unwrap();
        std::fs::write(dir.path().join("src/nested/util.rs"), "fn helper() {}\n").unwrap();
        std::fs::write(dir.path().join("target/gen.rs"), "fn run() {}\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "run the thing\n").unwrap();
        let ctx = ToolContext::new(
            "c1",
            SafeFs::new(dir.path()),
            Arc::new(RollbackJournal::new()),
            CancellationToken::new(),
        );
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_glob_matches_relative_paths() {
        let (_dir, ctx) = workspace();
        let out = GlobTool.execute(json!({"pattern": "src/**/*.rs"}), &ctx).await.unwrap();
        assert_eq!(out.output, "src/lib.rs\nsrc/nested/util.rs");
    }

    #[tokio::test]
    async fn test_grep_literal_with_include() {
        let (_dir, ctx) = workspace();
        let out = GrepTool
            .execute(json!({"pattern": "run", "include": "*.rs"}), &ctx)
            .await
            .unwrap();
        // target/ 被跳过，notes.md 被 include 过滤
        assert_eq!(out.output, "src/lib.rs:1: pub fn run() {}");
    }

    #[tokio::test]
    async fn test_grep_regex() {
        let (_dir, ctx) = workspace();
        let out = GrepTool
            .execute(json!({"pattern": r"^fn \w+", "use_regex": true}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.output, "src/nested/util.rs:1: fn helper() {}");
    }

    #[tokio::test]
    async fn test_grep_invalid_regex() {
        let (_dir, ctx) = workspace();
        let err = GrepTool
            .execute(json!({"pattern": "(", "use_regex": true}), &ctx)
            .await
            .unwrap_err();
        assert!(err.starts_with("Invalid regex pattern"));
    }
}
