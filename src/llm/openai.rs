//! OpenAI 兼容 API 客户端
//!
//! reqwest 直接 POST `{base_url}/chat/completions`（DeepSeek、OpenAI、自建代理等均可）；
//! 非 2xx 响应保留状态码 / 响应头 / 响应体，交给 RetryPolicy 分类。`reasoning_content` 作为思考内容返回。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{ChatRequest, ModelTurn, ProviderClient, ProviderError};
use crate::memory::{Message, Role};
use crate::tools::ToolCall;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.prompt_tokens.load(Ordering::Relaxed);
        let completion = self.completion_tokens.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    pub usage: TokenUsage,
}

impl OpenAiCompatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            usage: TokenUsage::default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// 组装请求体
pub(crate) fn request_body(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_json).collect();
    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

fn message_json(m: &Message) -> Value {
    match m.role {
        Role::System => json!({"role": "system", "content": m.content}),
        Role::User => json!({"role": "user", "content": m.content}),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
        Role::Assistant if m.tool_calls.is_empty() => {
            json!({"role": "assistant", "content": m.content})
        }
        Role::Assistant => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments.to_string()},
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// 解析响应体为一轮
pub(crate) fn parse_turn(status: u16, body: &str) -> Result<(ModelTurn, Option<(u64, u64)>), ProviderError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::http(status, format!("invalid completion response: {e}: {body}")))?;
    let usage = parsed.usage.map(|u| (u.prompt_tokens, u.completion_tokens));
    let Some(choice) = parsed.choices.into_iter().next() else {
        return Ok((ModelTurn::default(), usage));
    };
    let message = choice.message;
    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|c| {
            // 参数不是合法 JSON 时原样保留为字符串，由 schema 校验拒绝
            let arguments = if c.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&c.function.arguments)
                    .unwrap_or(Value::String(c.function.arguments))
            };
            ToolCall::new(c.id, c.function.name, arguments)
        })
        .collect();
    let turn = ModelTurn {
        text: message.content.filter(|s| !s.is_empty()),
        thinking: message.reasoning_content.filter(|s| !s.is_empty()),
        tool_calls,
    };
    Ok((turn, usage))
}

#[async_trait]
impl ProviderClient for OpenAiCompatProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ModelTurn, ProviderError> {
        let mut builder = self.http.post(self.endpoint()).json(&request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_ascii_lowercase(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            tracing::debug!(status, model = %request.model, "provider returned error status");
            return Err(ProviderError::Http { status, headers, body });
        }

        let (turn, usage) = parse_turn(status, &body)?;
        if let Some((prompt, completion)) = usage {
            self.usage.add(prompt, completion);
        }
        Ok(turn)
    }
}
