//! 键盘控制
//!
//! 把 crossterm 键盘事件映射为 ControlSignal；未绑定的键返回 None。
//! 默认：Esc / Ctrl+C 中止，Ctrl+Z 中止并回滚，Ctrl+P 暂停/继续，Ctrl+T 切换单步，Ctrl+N 单步前进。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio_util::sync::CancellationToken;

use crate::core::{ControlSignal, ExecutionController};

/// 按键绑定表
#[derive(Debug, Clone)]
pub struct KeyBindings {
    map: HashMap<(KeyCode, KeyModifiers), ControlSignal>,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self::empty()
            .bind(KeyCode::Esc, KeyModifiers::NONE, ControlSignal::Abort)
            .bind(KeyCode::Char('c'), KeyModifiers::CONTROL, ControlSignal::Abort)
            .bind(KeyCode::Char('z'), KeyModifiers::CONTROL, ControlSignal::AbortWithRollback)
            .bind(KeyCode::Char('p'), KeyModifiers::CONTROL, ControlSignal::TogglePause)
            .bind(KeyCode::Char('t'), KeyModifiers::CONTROL, ControlSignal::ToggleStepMode)
            .bind(KeyCode::Char('n'), KeyModifiers::CONTROL, ControlSignal::AdvanceStep)
    }
}

impl KeyBindings {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// 绑定（覆盖已有绑定）
    pub fn bind(mut self, code: KeyCode, modifiers: KeyModifiers, signal: ControlSignal) -> Self {
        self.map.insert(normalize(code, modifiers), signal);
        self
    }

    /// 只响应按下（含长按重复），忽略松开
    pub fn lookup(&self, key: &KeyEvent) -> Option<ControlSignal> {
        if key.kind == KeyEventKind::Release {
            return None;
        }
        self.map.get(&normalize(key.code, key.modifiers)).copied()
    }

    /// 查表并把信号交给控制器；返回命中的信号
    pub fn dispatch(&self, key: &KeyEvent, controller: &ExecutionController) -> Option<ControlSignal> {
        let signal = self.lookup(key)?;
        controller.signal(signal);
        Some(signal)
    }
}

/// 字母键忽略大小写与 Shift，只保留 Ctrl / Alt
fn normalize(code: KeyCode, modifiers: KeyModifiers) -> (KeyCode, KeyModifiers) {
    let modifiers = modifiers & (KeyModifiers::CONTROL | KeyModifiers::ALT);
    match code {
        KeyCode::Char(c) => (KeyCode::Char(c.to_ascii_lowercase()), modifiers),
        other => (other, modifiers),
    }
}

/// 在阻塞线程中轮询键盘（100ms 一次），命中绑定即发信号；stop 取消后退出。需要调用方已开启 raw mode。
pub fn spawn_key_listener(
    controller: Arc<ExecutionController>,
    bindings: KeyBindings,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !stop.is_cancelled() {
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => {
                    if let Ok(Event::Key(key)) = event::read() {
                        if let Some(signal) = bindings.dispatch(&key, &controller) {
                            tracing::debug!(?signal, "key signal");
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "keyboard polling failed, listener stopped");
                    break;
                }
            }
        }
    })
}
