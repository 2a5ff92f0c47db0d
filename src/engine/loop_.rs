//! Agent 主循环
//!
//! 每轮：控制器检查 → 请求模型（重试 / 退避 / 额度切换）→ 按模型给出的顺序逐个派发工具调用
//! （解析校验 → 权限闸门 → 执行 → 回灌结果）。工具严格串行执行，回滚日志的顺序与「至多一个待决权限请求」依赖于此。
//!
//! 挂起点：等待模型、等待权限、暂停、等待单步。中止信号在这些点以及每轮开头被观察到；
//! 已在执行中的工具会跑完（或被自身的取消/超时打断）后才进入中止收尾。

use std::sync::Arc;

use crate::core::{
    Checkpoint, ExecutionController, PermissionGate, PermissionRequest, RetryAction, RetryPolicy,
    RollbackJournal,
};
use crate::engine::{AgentOptions, AgentResult, ChatMode, StopReason, ToolCallRecord};
use crate::llm::{collect_turn, ChatRequest, ModelTurn, ProviderError, ProviderSlot, StreamChunk};
use crate::memory::{Message, Role};
use crate::tools::{
    SafeFs, ToolCall, ToolContext, ToolExecutor, ToolRegistry, ToolResult, ToolSpec, SUBMIT_PLAN,
};

const PLAN_MODE_PROMPT: &str = "You are in plan mode. Investigate with the read-only tools, do not modify anything, \
and finish by calling submit_plan with the complete step-by-step plan.";

/// 一轮模型请求的结局
enum TurnOutcome {
    Turn(ModelTurn),
    /// 暂时性错误用完了重试预算：计一次失败，下一轮再试
    Exhausted(String),
    Fatal(String),
    Aborted,
}

/// 运行期间的可变状态；每次 run 新建
struct RunState {
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
    records: Vec<ToolCallRecord>,
    iterations: usize,
    streak: usize,
    provider: usize,
    final_response: String,
}

/// Agent 主循环：持有本次运行私有的控制器、权限闸门与回滚日志
pub struct AgentLoop {
    options: AgentOptions,
    executor: ToolExecutor,
    retry: RetryPolicy,
    fs: SafeFs,
    controller: Arc<ExecutionController>,
    gate: Arc<PermissionGate>,
    journal: Arc<RollbackJournal>,
}

impl AgentLoop {
    pub fn new(options: AgentOptions, registry: Arc<ToolRegistry>) -> Self {
        let executor = ToolExecutor::new(registry, options.tool_timeout);
        let retry = RetryPolicy::new(options.retry.clone());
        let fs = SafeFs::new(&options.workspace);
        let gate = Arc::new(PermissionGate::new(options.auto_approve));
        Self {
            options,
            executor,
            retry,
            fs,
            controller: Arc::new(ExecutionController::new()),
            gate,
            journal: Arc::new(RollbackJournal::new()),
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// 外部信号（按键、系统信号、UI）经由它驱动运行
    pub fn controller(&self) -> Arc<ExecutionController> {
        Arc::clone(&self.controller)
    }

    /// UI 在这里注册权限处理器
    pub fn permission_gate(&self) -> Arc<PermissionGate> {
        Arc::clone(&self.gate)
    }

    pub fn journal(&self) -> Arc<RollbackJournal> {
        Arc::clone(&self.journal)
    }

    /// 运行到终止；AgentResult 总会返回，失败信息在 stop_reason / error 中
    pub async fn run(&mut self, initial_messages: Vec<Message>) -> AgentResult {
        self.journal.clear();
        self.gate.forget_remembered();
        self.controller.begin_run();

        let mut state = RunState {
            messages: self.prepare_messages(initial_messages),
            tools: self.executor.registry().specs(self.options.chat_mode),
            records: Vec::new(),
            iterations: 0,
            streak: 0,
            provider: 0,
            final_response: String::new(),
        };
        tracing::info!(
            mode = self.options.chat_mode.as_str(),
            max_iterations = self.options.max_iterations,
            tools = state.tools.len(),
            "agent run started"
        );

        let (mut stop_reason, error) = self.drive(&mut state).await;

        // 收尾时已进入中止：用户信号优先
        if stop_reason != StopReason::Aborted && self.controller.state().is_terminating() {
            stop_reason = StopReason::Aborted;
        }

        let mut rollback = None;
        if stop_reason == StopReason::Aborted {
            if self.controller.rollback_requested() {
                let report = self.journal.replay_reverse().await;
                tracing::info!(undone = report.undone, failures = report.failures.len(), "rollback finished");
                for failure in &report.failures {
                    self.options.observer.on_warning(&format!(
                        "rollback of {} failed: {}",
                        failure.path.display(),
                        failure.error
                    ));
                }
                rollback = Some(report);
            }
            self.controller.finish_abort();
        }

        if let Some(e) = &error {
            self.options.observer.on_error(e);
        }
        tracing::info!(
            stop_reason = stop_reason.as_str(),
            iterations = state.iterations,
            tool_calls = state.records.len(),
            "agent run finished"
        );

        AgentResult {
            success: stop_reason.is_success(),
            final_response: state.final_response,
            iterations: state.iterations,
            tool_calls: state.records,
            stop_reason,
            final_state: self.controller.state(),
            rollback,
            error,
        }
    }

    fn prepare_messages(&self, mut messages: Vec<Message>) -> Vec<Message> {
        let has_system = messages.first().map(|m| m.role == Role::System).unwrap_or(false);
        if !has_system {
            if let Some(prompt) = &self.options.system_prompt {
                messages.insert(0, Message::system(prompt.clone()));
            }
        }
        if self.options.chat_mode == ChatMode::Plan {
            let at = usize::from(messages.first().map(|m| m.role == Role::System).unwrap_or(false));
            messages.insert(at, Message::system(PLAN_MODE_PROMPT));
        }
        messages
    }

    async fn drive(&self, state: &mut RunState) -> (StopReason, Option<String>) {
        let observer = Arc::clone(&self.options.observer);
        let threshold = self.options.consecutive_error_threshold.max(1);

        loop {
            if state.iterations >= self.options.max_iterations {
                return (StopReason::MaxIterations, None);
            }
            if self.controller.checkpoint().await == Checkpoint::Abort {
                return (StopReason::Aborted, None);
            }
            state.iterations += 1;
            observer.on_iteration(state.iterations, self.options.max_iterations);

            let turn = match self.request_turn(state).await {
                TurnOutcome::Turn(turn) => turn,
                TurnOutcome::Aborted => return (StopReason::Aborted, None),
                TurnOutcome::Fatal(e) => return (StopReason::Error, Some(e)),
                TurnOutcome::Exhausted(e) => {
                    state.streak += 1;
                    observer.on_warning(&format!("provider unavailable: {e}"));
                    if state.streak >= threshold {
                        return (StopReason::ConsecutiveErrors, Some(e));
                    }
                    continue;
                }
            };

            if !self.options.streaming {
                if let Some(thinking) = &turn.thinking {
                    observer.on_thinking(thinking);
                }
                if let Some(text) = turn.text.as_deref().filter(|t| !t.is_empty()) {
                    observer.on_text(text);
                }
            }

            let text = turn.text.unwrap_or_default();
            if turn.tool_calls.is_empty() {
                state.messages.push(Message::assistant(text.clone()));
                state.final_response = text;
                return (StopReason::Completed, None);
            }

            state
                .messages
                .push(Message::assistant_tool_calls(text, turn.tool_calls.clone()));

            for call in turn.tool_calls {
                if self.controller.checkpoint().await == Checkpoint::Abort {
                    return (StopReason::Aborted, None);
                }
                observer.on_tool_call(&call);
                let Some(result) = self.dispatch(&call).await else {
                    return (StopReason::Aborted, None);
                };
                observer.on_tool_result(&call, &result);
                state
                    .messages
                    .push(Message::tool_result(&call.id, result.to_model_content()));

                let success = result.success;
                let submitted_plan = success && call.name == SUBMIT_PLAN;
                if submitted_plan {
                    state.final_response = result.output.clone();
                }
                state.records.push(ToolCallRecord { call, result });

                if success {
                    state.streak = 0;
                } else {
                    state.streak += 1;
                    if state.streak >= threshold {
                        return (
                            StopReason::ConsecutiveErrors,
                            Some(format!("{} consecutive failed tool calls", state.streak)),
                        );
                    }
                }
                if submitted_plan {
                    return (StopReason::PlanApproval, None);
                }

                if self.controller.enter_step_wait()
                    && self.controller.checkpoint().await == Checkpoint::Abort
                {
                    return (StopReason::Aborted, None);
                }
            }
        }
    }

    /// 单个工具调用：解析校验 → 权限 → 执行；中止打断权限等待时返回 None
    async fn dispatch(&self, call: &ToolCall) -> Option<ToolResult> {
        let def = match self.executor.prepare(call, self.options.chat_mode) {
            Ok(def) => def,
            Err(rejected) => return Some(rejected),
        };

        let tool = def.tool();
        if tool.requires_approval() {
            let request = PermissionRequest::new(
                tool.permission_kind(),
                &call.name,
                tool.approval_subject(&call.arguments),
            );
            let response = tokio::select! {
                response = self.gate.authorize(request) => Some(response),
                _ = self.controller.aborted() => None,
            }?;
            if !response.approved {
                tracing::info!(tool = %call.name, call_id = %call.id, "tool call denied");
                return Some(ToolResult::failed(&call.id, &call.name, "Permission denied by user"));
            }
        }

        let ctx = ToolContext::new(
            &call.id,
            self.fs.clone(),
            Arc::clone(&self.journal),
            self.controller.cancel_token(),
        );
        Some(self.executor.run(&def, call, &ctx).await)
    }

    /// 请求一轮：暂时性错误按策略退避重试，额度耗尽切到下一个提供方（不消耗迭代）
    async fn request_turn(&self, state: &mut RunState) -> TurnOutcome {
        let observer = Arc::clone(&self.options.observer);
        let providers = &self.options.providers;
        let mut attempt: u32 = 0;

        loop {
            let Some(slot) = providers.get(state.provider) else {
                return TurnOutcome::Fatal("no provider configured".to_string());
            };
            attempt += 1;
            let request = ChatRequest {
                model: slot.model.clone(),
                messages: state.messages.clone(),
                tools: state.tools.clone(),
            };

            let result = tokio::select! {
                result = self.call_provider(slot, &request) => Some(result),
                _ = self.controller.aborted() => None,
            };
            let err = match result {
                None => return TurnOutcome::Aborted,
                Some(Ok(turn)) => return TurnOutcome::Turn(turn),
                Some(Err(err)) => err,
            };

            let next = Some(state.provider + 1).filter(|i| *i < providers.len());
            let decision = self.retry.decide(&err, attempt, next);
            tracing::warn!(
                provider = %slot.label(),
                class = decision.class.as_str(),
                action = ?decision.action,
                attempt,
                error = %err,
                "provider call failed"
            );

            match decision.action {
                RetryAction::Retry => {
                    let delay = decision.delay.unwrap_or_default();
                    observer.on_warning(&format!(
                        "{} error from {}, retrying in {}ms (attempt {}/{})",
                        decision.class.as_str(),
                        slot.label(),
                        delay.as_millis(),
                        attempt,
                        self.retry.config().max_attempts
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.controller.aborted() => return TurnOutcome::Aborted,
                    }
                }
                RetryAction::SwitchProvider => {
                    let Some(idx) = decision.next_provider else {
                        return TurnOutcome::Fatal(err.to_string());
                    };
                    let to = providers.get(idx).map(ProviderSlot::label).unwrap_or_default();
                    observer.on_warning(&format!("quota exceeded on {}, switching to {to}", slot.label()));
                    tracing::info!(from = %slot.label(), to = %to, "provider switched");
                    state.provider = idx;
                    attempt = 0;
                }
                RetryAction::Fail if decision.is_exhausted_transient() => {
                    return TurnOutcome::Exhausted(err.to_string());
                }
                RetryAction::Fail => return TurnOutcome::Fatal(err.to_string()),
            }
        }
    }

    async fn call_provider(&self, slot: &ProviderSlot, request: &ChatRequest) -> Result<ModelTurn, ProviderError> {
        if !self.options.streaming {
            return slot.client.chat(request).await;
        }
        let observer = Arc::clone(&self.options.observer);
        let chunks = slot.client.chat_stream(request).await?;
        collect_turn(chunks, |chunk| match chunk {
            StreamChunk::Text(t) => observer.on_text(t),
            StreamChunk::Thinking(t) => observer.on_thinking(t),
            StreamChunk::ToolCall(_) => {}
        })
        .await
    }
}
