//! 模型提供方抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ProviderClient：chat（一次性返回一轮）、chat_stream（增量返回文本/思考/工具调用）。
//! 错误统一归一化为 ProviderError（状态码、响应头、响应体），供 RetryPolicy 分类。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use thiserror::Error;

use crate::memory::Message;
use crate::tools::{ToolCall, ToolSpec};

/// 一次模型请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// 本轮可用工具（按注册顺序）
    pub tools: Vec<ToolSpec>,
}

/// 模型返回的一轮：最终文本，或一组工具调用（也可能二者兼有）
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    /// 拆成流式片段（默认 chat_stream 实现使用）
    pub fn into_chunks(self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        if let Some(t) = self.thinking {
            chunks.push(StreamChunk::Thinking(t));
        }
        if let Some(t) = self.text {
            chunks.push(StreamChunk::Text(t));
        }
        chunks.extend(self.tool_calls.into_iter().map(StreamChunk::ToolCall));
        chunks
    }

    /// 追加一个流式片段
    pub fn absorb(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Text(t) => self.text.get_or_insert_with(String::new).push_str(&t),
            StreamChunk::Thinking(t) => self.thinking.get_or_insert_with(String::new).push_str(&t),
            StreamChunk::ToolCall(c) => self.tool_calls.push(c),
        }
    }
}

/// 流式片段
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Thinking(String),
    ToolCall(ToolCall),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Provider 调用失败：线上错误没有类型，只保留状态码 / 响应头 / 响应体供分类
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// 未拿到 HTTP 响应（连接失败、超时、连接被重置等）
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        /// 小写头名
        headers: HashMap<String, String>,
        body: String,
    },
}

impl ProviderError {
    pub fn transport(message: impl Into<String>) -> Self {
        ProviderError::Transport {
            message: message.into(),
        }
    }

    pub fn http(status: u16, body: impl Into<String>) -> Self {
        ProviderError::Http {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        if let ProviderError::Http { headers, .. } = &mut self {
            headers.insert(name.to_ascii_lowercase(), value.into());
        }
        self
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            ProviderError::Transport { .. } => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            ProviderError::Http { headers, .. } => {
                headers.get(&name.to_ascii_lowercase()).map(String::as_str)
            }
            ProviderError::Transport { .. } => None,
        }
    }

    /// 响应体；传输错误时为错误描述
    pub fn body(&self) -> &str {
        match self {
            ProviderError::Http { body, .. } => body,
            ProviderError::Transport { message } => message,
        }
    }
}

/// 模型提供方
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// 非流式：返回完整一轮
    async fn chat(&self, request: &ChatRequest) -> Result<ModelTurn, ProviderError>;

    /// 流式：默认把 chat 的结果拆成片段
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError> {
        let turn = self.chat(request).await?;
        Ok(Box::pin(stream::iter(turn.into_chunks().into_iter().map(Ok))))
    }
}

/// 级联中的一个提供方：名称 + 模型 + 客户端
#[derive(Clone)]
pub struct ProviderSlot {
    pub name: String,
    pub model: String,
    pub client: Arc<dyn ProviderClient>,
}

impl ProviderSlot {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        client: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            client,
        }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.name, self.model)
    }
}

impl std::fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("name", &self.name)
            .field("model", &self.model)
            .finish()
    }
}

/// 把流收拢成一轮；每个片段先交给 on_chunk（用于实时展示）
pub async fn collect_turn<F>(mut chunks: ChunkStream, mut on_chunk: F) -> Result<ModelTurn, ProviderError>
where
    F: FnMut(&StreamChunk),
{
    let mut turn = ModelTurn::default();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        on_chunk(&chunk);
        turn.absorb(chunk);
    }
    Ok(turn)
}
