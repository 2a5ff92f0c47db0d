//! 无头运行时：从配置组装 provider 级联、工具注册表与 AgentLoop，跑一次 print 模式
//!
//! 交互审批走 stdin（y / n / a）；auto_approve 且 stdin 为终端时开启 raw mode 监听控制键。

use std::future::Future;
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ProviderSection};
use crate::core::{
    install_signal_handlers, spawn_key_listener, AgentError, KeyBindings, PermissionHandler,
    PermissionRequest, PermissionResponse,
};
use crate::engine::{AgentLoop, AgentOptions, AgentResult, ChatMode, TracingObserver};
use crate::llm::{OpenAiCompatProvider, ProviderSlot};
use crate::memory::Message;
use crate::tools::{register_builtin_tools, ToolRegistry};

/// 运行时覆盖项（来自命令行）
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub chat_mode: Option<ChatMode>,
    pub auto_approve: Option<bool>,
    pub max_iterations: Option<usize>,
}

fn build_slot(section: &ProviderSection, request_timeout: Duration) -> Result<ProviderSlot, AgentError> {
    let key_env = section.resolved_api_key_env();
    let api_key = section
        .api_key()
        .ok_or_else(|| AgentError::Config(format!("API key not set: export {key_env}")))?;
    let client = OpenAiCompatProvider::new(section.resolved_base_url(), Some(api_key), request_timeout)?;
    Ok(ProviderSlot::new(section.provider.clone(), section.model.clone(), Arc::new(client)))
}

/// 主提供方缺少 Key 时报错；备用提供方缺少 Key 时跳过
pub fn build_providers(cfg: &AppConfig) -> Result<Vec<ProviderSlot>, AgentError> {
    let timeout = Duration::from_secs(cfg.llm.timeouts.request.max(1));
    let mut slots = vec![build_slot(&cfg.llm.primary(), timeout)?];
    for fallback in &cfg.llm.fallbacks {
        match build_slot(fallback, timeout) {
            Ok(slot) => slots.push(slot),
            Err(e) => tracing::warn!(provider = %fallback.provider, error = %e, "fallback provider skipped"),
        }
    }
    Ok(slots)
}

/// 内置工具注册表
pub fn build_registry(cfg: &AppConfig) -> Result<ToolRegistry, AgentError> {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(
        &mut registry,
        cfg.tools.shell.allowed_commands.clone(),
        cfg.tools.shell.timeout_secs,
    )?;
    Ok(registry)
}

/// 由配置与覆盖项生成 AgentOptions
pub fn build_options(
    cfg: &AppConfig,
    providers: Vec<ProviderSlot>,
    overrides: &RunOverrides,
) -> Result<AgentOptions, AgentError> {
    let mut providers = providers.into_iter();
    let primary = providers
        .next()
        .ok_or_else(|| AgentError::Config("no provider configured".to_string()))?;

    let mut options = AgentOptions::new(primary, cfg.workspace_root())
        .with_max_iterations(overrides.max_iterations.unwrap_or(cfg.agent.max_iterations))
        .with_chat_mode(overrides.chat_mode.unwrap_or(cfg.agent.chat_mode))
        .with_auto_approve(overrides.auto_approve.unwrap_or(cfg.agent.auto_approve))
        .with_streaming(cfg.agent.streaming)
        .with_error_threshold(cfg.agent.consecutive_error_threshold)
        .with_retry(cfg.retry.clone())
        .with_tool_timeout(Duration::from_secs(cfg.tools.tool_timeout_secs.max(1)))
        .with_observer(Arc::new(TracingObserver));
    for slot in providers {
        options = options.with_fallback(slot);
    }
    if let Some(prompt) = &cfg.agent.system_prompt {
        options = options.with_system_prompt(prompt.clone());
    }
    Ok(options)
}

/// 终端审批：在 stderr 打印请求，从 stdin 读取 y（允许）/ a（允许并记住）/ 其它（拒绝）
///
/// stdin 不是终端时直接拒绝。
#[derive(Debug, Default)]
pub struct StdinPermissionHandler;

fn parse_answer(line: &str) -> PermissionResponse {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PermissionResponse::approve(),
        "a" | "always" => PermissionResponse::approve_and_remember(),
        _ => PermissionResponse::deny(),
    }
}

#[async_trait]
impl PermissionHandler for StdinPermissionHandler {
    async fn handle(&self, request: PermissionRequest) -> PermissionResponse {
        if !std::io::stdin().is_terminal() {
            tracing::warn!(tool = %request.tool, "stdin is not a terminal, permission denied");
            return PermissionResponse::deny();
        }
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = writeln!(stderr, "\n[{}] {}", request.tool, request.description);
            if let Some(command) = &request.command {
                let _ = writeln!(stderr, "  $ {command}");
            }
            if let Some(path) = &request.path {
                let _ = writeln!(stderr, "  path: {path}");
            }
            let _ = write!(stderr, "Allow? [y]es / [n]o / [a]lways: ");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => parse_answer(&line),
            _ => PermissionResponse::deny(),
        }
    }
}

/// raw mode 守卫：离开作用域时恢复终端
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// 运行时退出时等待阻塞任务的上限
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// 在新建的多线程运行时上跑完 `future`，随后限时关闭运行时
///
/// 审批提示里的 stdin 读取无法取消；直接 drop 运行时会一直等它返回。
pub fn run_blocking<F: Future>(future: F) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

/// print 模式：单条用户输入跑完整个循环并返回结果
pub async fn run_print_mode(
    cfg: &AppConfig,
    prompt: &str,
    overrides: RunOverrides,
) -> Result<AgentResult, AgentError> {
    let providers = build_providers(cfg)?;
    let registry = Arc::new(build_registry(cfg)?);
    let options = build_options(cfg, providers, &overrides)?;
    let auto_approve = options.auto_approve;

    let mut agent = AgentLoop::new(options, registry);
    let controller = agent.controller();
    install_signal_handlers(controller.clone());

    if !auto_approve {
        agent
            .permission_gate()
            .register_handler(Arc::new(StdinPermissionHandler))?;
    }

    let stop_keys = CancellationToken::new();
    let mut raw_guard = None;
    let mut listener = None;
    if auto_approve && std::io::stdin().is_terminal() {
        match RawModeGuard::enable() {
            Ok(guard) => {
                raw_guard = Some(guard);
                listener = Some(spawn_key_listener(
                    controller.clone(),
                    KeyBindings::default(),
                    stop_keys.clone(),
                ));
            }
            Err(e) => tracing::warn!(error = %e, "raw mode unavailable, key controls disabled"),
        }
    }

    let result = agent.run(vec![Message::user(prompt)]).await;

    stop_keys.cancel();
    if let Some(handle) = listener {
        let _ = handle.await;
    }
    drop(raw_guard);

    tracing::info!(
        stop_reason = result.stop_reason.as_str(),
        iterations = result.iterations,
        tool_calls = result.tool_calls.len(),
        "run finished"
    );
    Ok(result)
}
