//! 核心层：错误、执行控制器、权限闸门、重试策略、回滚日志、键盘与系统信号

pub mod controller;
pub mod error;
pub mod keymap;
pub mod permission;
pub mod retry;
pub mod rollback;
pub mod signals;

pub use controller::{Checkpoint, ControlSignal, ControllerSnapshot, ExecutionController, ExecutionState};
pub use error::AgentError;
pub use keymap::{spawn_key_listener, KeyBindings};
pub use permission::{
    ApprovalSubject, ChannelPermissionHandler, PermissionGate, PermissionHandler, PermissionKind,
    PermissionPrompt, PermissionRequest, PermissionResponse,
};
pub use retry::{retry_after, FailureClass, RetryAction, RetryConfig, RetryDecision, RetryPolicy};
pub use rollback::{PriorState, RollbackEntry, RollbackFailure, RollbackJournal, RollbackKind, RollbackReport};
pub use signals::install_signal_handlers;
