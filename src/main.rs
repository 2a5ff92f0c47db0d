//! hive 命令行入口
//!
//! 用法：`hive [--plan] [--yes] [--max-iterations N] [--config PATH] <prompt...>`
//! 最终回复写 stdout，日志与审批提示写 stderr。

use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::agent::{run_blocking, run_print_mode, RunOverrides};
use hive::config::load_config;
use hive::engine::ChatMode;

struct CliArgs {
    config: Option<PathBuf>,
    overrides: RunOverrides,
    prompt: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut config = None;
    let mut overrides = RunOverrides::default();
    let mut words = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--plan" => overrides.chat_mode = Some(ChatMode::Plan),
            "--yes" | "-y" => overrides.auto_approve = Some(true),
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--max-iterations" => {
                let n = args.next().context("--max-iterations needs a number")?;
                overrides.max_iterations = Some(n.parse().context("invalid --max-iterations")?);
            }
            _ => words.push(arg),
        }
    }
    let prompt = words.join(" ");
    if prompt.trim().is_empty() {
        bail!("usage: hive [--plan] [--yes] [--max-iterations N] [--config PATH] <prompt...>");
    }
    Ok(CliArgs {
        config,
        overrides,
        prompt,
    })
}

fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args = parse_args(std::env::args().skip(1))?;
    let cfg = load_config(args.config).context("Failed to load config")?;

    let result = run_blocking(run_print_mode(&cfg, &args.prompt, args.overrides))
        .context("Failed to start runtime")?
        .context("Agent run failed")?;

    if !result.final_response.is_empty() {
        println!("{}", result.final_response);
    }
    if !result.success {
        let detail = result.error.clone().unwrap_or_default();
        bail!("run stopped: {} {}", result.stop_reason.as_str(), detail);
    }
    Ok(())
}
