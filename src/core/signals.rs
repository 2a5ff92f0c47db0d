//! 系统信号：Ctrl+C / SIGTERM 转为控制器的中止信号
//!
//! 每次收到信号都会发一次 abort；已在中止中时控制器会忽略重复信号。

use std::sync::Arc;

use crate::core::ExecutionController;

/// 安装系统信号处理器 (Ctrl+C, SIGTERM)
pub fn install_signal_handlers(controller: Arc<ExecutionController>) {
    let on_ctrl_c = Arc::clone(&controller);
    tokio::spawn(async move {
        while let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!("Received Ctrl+C, aborting run");
            on_ctrl_c.abort();
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                while sigterm.recv().await.is_some() {
                    tracing::info!("Received SIGTERM, aborting run");
                    controller.abort();
                }
            }
        });
    }
}
