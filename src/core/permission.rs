//! 权限闸门
//!
//! 只有声明 `requires_approval` 的工具（写文件、删文件、执行 shell 等）经过此处；只读工具直接放行。
//! 同一时刻至多一个待决请求：第二个请求要等第一个被解决后才会发出。
//! 没有注册处理器且未开启 auto_approve 时，请求会一直挂起（直到注册处理器或运行被中止），这是约定的阻塞行为而不是错误。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::core::AgentError;

/// 需要批准的操作类别；「记住」的批准按类别生效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    FileWrite,
    FileDelete,
    ShellExec,
    External,
    Other,
}

/// 工具对一次调用的描述，用于生成 PermissionRequest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalSubject {
    pub description: String,
    pub command: Option<String>,
    pub path: Option<String>,
}

impl ApprovalSubject {
    pub fn describe(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PermissionKind,
    pub tool: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl PermissionRequest {
    pub fn new(kind: PermissionKind, tool: impl Into<String>, subject: ApprovalSubject) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            tool: tool.into(),
            description: subject.description,
            command: subject.command,
            path: subject.path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub approved: bool,
    /// 本次运行内对同类请求不再询问
    #[serde(default)]
    pub remember: bool,
}

impl PermissionResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            remember: false,
        }
    }

    pub fn approve_and_remember() -> Self {
        Self {
            approved: true,
            remember: true,
        }
    }

    pub fn deny() -> Self {
        Self {
            approved: false,
            remember: false,
        }
    }
}

/// 由 UI 层提供的权限处理器；每次运行只允许一个
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn handle(&self, request: PermissionRequest) -> PermissionResponse;
}

/// 权限闸门：单次运行私有
pub struct PermissionGate {
    auto_approve: bool,
    handler: watch::Sender<Option<Arc<dyn PermissionHandler>>>,
    /// 持有期间即「有一个待决请求」
    slot: tokio::sync::Mutex<()>,
    pending: watch::Sender<Option<PermissionRequest>>,
    remembered: Mutex<HashSet<PermissionKind>>,
}

impl PermissionGate {
    pub fn new(auto_approve: bool) -> Self {
        Self {
            auto_approve,
            handler: watch::Sender::new(None),
            slot: tokio::sync::Mutex::new(()),
            pending: watch::Sender::new(None),
            remembered: Mutex::new(HashSet::new()),
        }
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    /// 注册处理器；已有处理器时返回错误
    pub fn register_handler(&self, handler: Arc<dyn PermissionHandler>) -> Result<(), AgentError> {
        let mut handler = Some(handler);
        let registered = self.handler.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = handler.take();
                true
            } else {
                false
            }
        });
        if registered {
            Ok(())
        } else {
            Err(AgentError::PermissionHandlerAlreadyRegistered)
        }
    }

    /// 卸下处理器（如 UI 退出），之后可重新注册
    pub fn clear_handler(&self) {
        self.handler.send_replace(None);
    }

    pub fn has_handler(&self) -> bool {
        self.handler.borrow().is_some()
    }

    /// 当前待决的请求
    pub fn pending(&self) -> Option<PermissionRequest> {
        self.pending.borrow().clone()
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<Option<PermissionRequest>> {
        self.pending.subscribe()
    }

    /// 清空「记住」的批准（新一轮运行开始时）
    pub fn forget_remembered(&self) {
        self.remembered_set().clear();
    }

    /// 请求批准；挂起直到处理器给出答复
    pub async fn authorize(&self, request: PermissionRequest) -> PermissionResponse {
        if self.auto_approve {
            return PermissionResponse::approve();
        }
        if self.is_remembered(request.kind) {
            tracing::debug!(tool = %request.tool, kind = ?request.kind, "approved by remembered decision");
            return PermissionResponse::approve();
        }

        let _slot = self.slot.lock().await;
        // 排队期间可能已有同类请求被「记住」
        if self.is_remembered(request.kind) {
            return PermissionResponse::approve();
        }

        let kind = request.kind;
        let _pending = PendingGuard::raise(&self.pending, request.clone());
        tracing::info!(id = %request.id, tool = %request.tool, kind = ?kind, "permission requested");

        let handler = self.wait_for_handler().await;
        let response = handler.handle(request).await;
        tracing::info!(approved = response.approved, remember = response.remember, "permission resolved");

        if response.approved && response.remember {
            self.remembered_set().insert(kind);
        }
        response
    }

    async fn wait_for_handler(&self) -> Arc<dyn PermissionHandler> {
        let mut rx = self.handler.subscribe();
        if rx.borrow().is_none() {
            tracing::warn!("permission request pending: no handler registered");
        }
        loop {
            if let Some(h) = rx.borrow_and_update().clone() {
                return h;
            }
            // 发送端归闸门所有，只要 &self 有效就不会关闭
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    fn is_remembered(&self, kind: PermissionKind) -> bool {
        self.remembered_set().contains(&kind)
    }

    fn remembered_set(&self) -> std::sync::MutexGuard<'_, HashSet<PermissionKind>> {
        self.remembered.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 待决标记：请求被解决或等待被丢弃（中止）时清除
struct PendingGuard<'a> {
    pending: &'a watch::Sender<Option<PermissionRequest>>,
}

impl<'a> PendingGuard<'a> {
    fn raise(pending: &'a watch::Sender<Option<PermissionRequest>>, request: PermissionRequest) -> Self {
        pending.send_replace(Some(request));
        Self { pending }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.send_replace(None);
    }
}

/// 发往 UI 的一次询问：UI 通过 respond 回复
#[derive(Debug)]
pub struct PermissionPrompt {
    pub request: PermissionRequest,
    reply: oneshot::Sender<PermissionResponse>,
}

impl PermissionPrompt {
    /// 回复；闸门一侧已放弃等待时返回 false
    pub fn respond(self, response: PermissionResponse) -> bool {
        self.reply.send(response).is_ok()
    }
}

/// 基于通道的处理器：每个请求附带 oneshot 回复口，经 mpsc 交给任意 UI 异步作答
pub struct ChannelPermissionHandler {
    tx: mpsc::UnboundedSender<PermissionPrompt>,
}

impl ChannelPermissionHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PermissionPrompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PermissionHandler for ChannelPermissionHandler {
    async fn handle(&self, request: PermissionRequest) -> PermissionResponse {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PermissionPrompt { request, reply }).is_err() {
            tracing::warn!("permission channel closed, denying");
            return PermissionResponse::deny();
        }
        rx.await.unwrap_or_else(|_| {
            tracing::warn!("permission prompt dropped without answer, denying");
            PermissionResponse::deny()
        })
    }
}
