//! Shell 工具：需审批，禁止危险子串，可选命令白名单
//!
//! 执行通过 sh -c / cmd /C，在工作区根目录下运行，带超时；中止时取消令牌触发，子进程随之被杀掉（kill_on_drop）。

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::core::{ApprovalSubject, PermissionKind};
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// 即使命令在白名单中也不允许出现的子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "curl | sh",
    "wget | sh",
    "chmod 777 /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 输出上限（字符）
const MAX_OUTPUT_CHARS: usize = 30_000;

#[derive(Debug, Deserialize, JsonSchema)]
struct ShellArgs {
    /// 要执行的命令
    command: String,
}

/// Shell 工具
pub struct ShellTool {
    /// 为空表示不限制命令名
    allowed_commands: HashSet<String>,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            allowed_commands,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 只取第一个 token 作为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {forbidden}"));
        }
        let name = Self::command_name(&lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.is_empty() || self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{name}' not in allowlist"))
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        format!("{}\n... (truncated)", s.chars().take(MAX_OUTPUT_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace root and return its stdout/stderr. Requires approval."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ShellArgs>()
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn permission_kind(&self) -> PermissionKind {
        PermissionKind::ShellExec
    }

    fn approval_subject(&self, args: &Value) -> ApprovalSubject {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        ApprovalSubject::describe(format!("Run shell command: {command}")).with_command(command)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: ShellArgs = parse_args(args)?;
        let command = args.command.trim();
        self.check(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(ctx.fs.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| format!("Execution failed: {e}"))?;
        let output = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => res
                .map_err(|_| format!("Command timed out after {}s", self.timeout.as_secs()))?
                .map_err(|e| format!("Execution failed: {e}"))?,
            _ = ctx.cancel.cancelled() => return Err("Command cancelled".to_string()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(truncate(&format!(
                "Exit {}\nstdout: {}\nstderr: {}",
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stdout.trim(),
                stderr.trim()
            )));
        }
        let text = if stderr.trim().is_empty() {
            stdout.to_string()
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        };
        Ok(ToolOutput::new(command.to_string(), truncate(&text)))
    }
}
