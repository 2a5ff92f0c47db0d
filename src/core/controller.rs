//! 执行控制器：运行 / 暂停 / 单步 / 中止 状态机
//!
//! 状态由 watch 通道持有，AgentLoop 在每个挂起点 await `checkpoint()`；外部信号（按键、系统信号）
//! 通过 `signal()` 驱动状态迁移，每个信号至多对应一次迁移，无法迁移时忽略。
//!
//! ```text
//! running <-> paused            (toggle-pause)
//! running  -> waiting_step      (工具调用结束且处于单步模式)
//! waiting_step -> running       (advance-step / 关闭单步模式)
//! running|paused|waiting_step -> aborting -> stopped
//! ```

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 单次运行的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Paused,
    WaitingStep,
    Aborting,
    Stopped,
}

impl ExecutionState {
    pub fn is_terminating(self) -> bool {
        matches!(self, ExecutionState::Aborting | ExecutionState::Stopped)
    }
}

/// 外部控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    TogglePause,
    Abort,
    AbortWithRollback,
    ToggleStepMode,
    AdvanceStep,
}

/// checkpoint 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub state: ExecutionState,
    pub step_mode: bool,
    pub rollback_requested: bool,
}

/// 执行控制器：「循环能否继续」的唯一判定者
#[derive(Debug)]
pub struct ExecutionController {
    state_tx: watch::Sender<ControllerSnapshot>,
    /// 中止时取消，供工具尽力中断（如杀掉子进程）；新一轮运行时换新
    cancel_token: Mutex<CancellationToken>,
}

impl Default for ExecutionController {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionController {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ControllerSnapshot {
            state: ExecutionState::Running,
            step_mode: false,
            rollback_requested: false,
        });
        Self {
            state_tx,
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        *self.state_tx.borrow()
    }

    pub fn state(&self) -> ExecutionState {
        self.snapshot().state
    }

    pub fn step_mode(&self) -> bool {
        self.snapshot().step_mode
    }

    pub fn rollback_requested(&self) -> bool {
        self.snapshot().rollback_requested
    }

    /// 订阅状态变化（UI 展示用）
    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 处理外部信号；返回是否发生了迁移
    pub fn signal(&self, signal: ControlSignal) -> bool {
        let changed = self.state_tx.send_if_modified(|s| transition(s, signal));
        if changed {
            let snap = self.snapshot();
            tracing::info!(?signal, state = ?snap.state, step_mode = snap.step_mode, "execution state changed");
            if snap.state == ExecutionState::Aborting {
                self.cancel_token().cancel();
            }
        } else {
            tracing::debug!(?signal, state = ?self.state(), "signal ignored");
        }
        changed
    }

    pub fn toggle_pause(&self) -> bool {
        self.signal(ControlSignal::TogglePause)
    }

    pub fn abort(&self) -> bool {
        self.signal(ControlSignal::Abort)
    }

    pub fn abort_with_rollback(&self) -> bool {
        self.signal(ControlSignal::AbortWithRollback)
    }

    pub fn toggle_step_mode(&self) -> bool {
        self.signal(ControlSignal::ToggleStepMode)
    }

    pub fn advance_step(&self) -> bool {
        self.signal(ControlSignal::AdvanceStep)
    }

    /// 挂起直到可以继续（running）或需要中止（aborting / stopped）
    pub async fn checkpoint(&self) -> Checkpoint {
        let mut rx = self.state_tx.subscribe();
        let res = rx
            .wait_for(|s| matches!(s.state, ExecutionState::Running) || s.state.is_terminating())
            .await;
        match res {
            Ok(snap) if snap.state == ExecutionState::Running => Checkpoint::Proceed,
            _ => Checkpoint::Abort,
        }
    }

    /// 在收到中止信号时完成；供挂起中的等待（模型请求、权限、退避）与之竞争
    pub async fn aborted(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| s.state.is_terminating()).await;
    }

    /// 工具调用结束后调用：单步模式下 running -> waiting_step；返回是否进入等待
    pub fn enter_step_wait(&self) -> bool {
        self.state_tx.send_if_modified(|s| {
            if s.step_mode && s.state == ExecutionState::Running {
                s.state = ExecutionState::WaitingStep;
                true
            } else {
                false
            }
        })
    }

    /// 新的顶层运行开始：上一轮遗留的 aborting / stopped 回到 running；其余状态（如预先暂停）保留
    ///
    /// 两轮运行之间收到的中止信号只作用于已结束的那一轮，不会带进下一轮。
    pub fn begin_run(&self) {
        let reset = self.state_tx.send_if_modified(|s| {
            if s.state.is_terminating() {
                s.state = ExecutionState::Running;
                s.rollback_requested = false;
                true
            } else {
                false
            }
        });
        if reset {
            *self.cancel_token.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        }
    }

    /// 中止收尾：aborting -> stopped（回滚已完成之后）
    pub fn finish_abort(&self) -> bool {
        self.state_tx.send_if_modified(|s| {
            if s.state == ExecutionState::Aborting {
                s.state = ExecutionState::Stopped;
                true
            } else {
                false
            }
        })
    }
}

fn transition(s: &mut ControllerSnapshot, signal: ControlSignal) -> bool {
    use ExecutionState::{Aborting, Paused, Running, Stopped, WaitingStep};

    if matches!(s.state, Aborting | Stopped) {
        return false;
    }
    match signal {
        ControlSignal::TogglePause => match s.state {
            Running => {
                s.state = Paused;
                true
            }
            Paused => {
                s.state = Running;
                true
            }
            _ => false,
        },
        ControlSignal::Abort | ControlSignal::AbortWithRollback => {
            s.state = Aborting;
            s.rollback_requested = signal == ControlSignal::AbortWithRollback;
            true
        }
        ControlSignal::ToggleStepMode => {
            s.step_mode = !s.step_mode;
            if !s.step_mode && s.state == WaitingStep {
                s.state = Running;
            }
            true
        }
        ControlSignal::AdvanceStep => {
            if s.state == WaitingStep {
                s.state = Running;
                true
            } else {
                false
            }
        }
    }
}
