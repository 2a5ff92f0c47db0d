//! 脚本化 Provider，仅供测试使用；可执行文件始终走真实的 HTTP Provider
//!
//! 按顺序吐出预先排好的轮次或错误；脚本用完后返回空轮（无文本、无工具调用）。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatRequest, ModelTurn, ProviderClient, ProviderError};

type Scripted = Result<ModelTurn, ProviderError>;

/// 脚本化客户端：记录收到的每个请求
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: impl IntoIterator<Item = ModelTurn>) -> Self {
        let provider = Self::new();
        for turn in turns {
            provider.push_turn(turn);
        }
        provider
    }

    /// 每次调用前等待（用于中止/暂停相关测试）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push_turn(&self, turn: ModelTurn) -> &Self {
        self.lock_script().push_back(Ok(turn));
        self
    }

    pub fn push_error(&self, err: ProviderError) -> &Self {
        self.lock_script().push_back(Err(err));
        self
    }

    /// 已收到的请求数
    pub fn calls(&self) -> usize {
        self.lock_requests().len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.lock_requests().clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock_script().len()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<ChatRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ModelTurn, ProviderError> {
        self.lock_requests().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.lock_script().pop_front();
        next.unwrap_or_else(|| Ok(ModelTurn::default()))
    }
}
