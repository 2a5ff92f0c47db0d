//! 单次运行的配置（运行期间不可变）

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::RetryConfig;
use crate::engine::{AgentObserver, NoopObserver};
use crate::llm::ProviderSlot;

/// 对话模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    /// 全部工具可用
    #[default]
    Agent,
    /// 只读工具 + submit_plan，提交计划即结束
    Plan,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::Agent => "agent",
            ChatMode::Plan => "plan",
        }
    }
}

/// AgentOptions：provider 级联、迭代上限、模式、审批、观察者等
#[derive(Clone)]
pub struct AgentOptions {
    /// 首个为主提供方，其后为按顺序的备用提供方
    pub providers: Vec<ProviderSlot>,
    pub max_iterations: usize,
    pub chat_mode: ChatMode,
    pub auto_approve: bool,
    pub streaming: bool,
    pub system_prompt: Option<String>,
    pub consecutive_error_threshold: usize,
    pub retry: RetryConfig,
    pub tool_timeout: Duration,
    pub workspace: PathBuf,
    pub observer: Arc<dyn AgentObserver>,
}

impl AgentOptions {
    pub fn new(primary: ProviderSlot, workspace: impl Into<PathBuf>) -> Self {
        Self {
            providers: vec![primary],
            max_iterations: 25,
            chat_mode: ChatMode::Agent,
            auto_approve: false,
            streaming: false,
            system_prompt: None,
            consecutive_error_threshold: 3,
            retry: RetryConfig::default(),
            tool_timeout: Duration::from_secs(120),
            workspace: workspace.into(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_fallback(mut self, slot: ProviderSlot) -> Self {
        self.providers.push(slot);
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_chat_mode(mut self, mode: ChatMode) -> Self {
        self.chat_mode = mode;
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_error_threshold(mut self, threshold: usize) -> Self {
        self.consecutive_error_threshold = threshold.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = observer;
        self
    }
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("providers", &self.providers)
            .field("max_iterations", &self.max_iterations)
            .field("chat_mode", &self.chat_mode)
            .field("auto_approve", &self.auto_approve)
            .field("streaming", &self.streaming)
            .field("consecutive_error_threshold", &self.consecutive_error_threshold)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}
