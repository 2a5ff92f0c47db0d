//! 回滚日志
//!
//! 只有修改文件的工具在动手之前追加条目，记录操作前的内容（或「原本不存在」）；
//! abort-with-rollback 时按插入的逆序逐条撤销。撤销是尽力而为：某条失败会记录下来，剩余条目照常撤销。

use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    Write,
    Edit,
    Delete,
    Create,
}

/// 操作前的文件状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorState {
    Content(Vec<u8>),
    Absent,
}

#[derive(Debug, Clone)]
pub struct RollbackEntry {
    pub tool_call_id: String,
    pub kind: RollbackKind,
    pub path: PathBuf,
    pub prior: PriorState,
}

impl RollbackEntry {
    pub fn new(
        tool_call_id: impl Into<String>,
        kind: RollbackKind,
        path: impl Into<PathBuf>,
        prior: PriorState,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            kind,
            path: path.into(),
            prior,
        }
    }

    /// 把文件恢复到 prior
    async fn undo(&self) -> std::io::Result<()> {
        match &self.prior {
            PriorState::Absent => match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            PriorState::Content(bytes) => {
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&self.path, bytes).await
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub tool_call_id: String,
    pub path: PathBuf,
    pub error: String,
}

/// 一次回放的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub undone: usize,
    pub failures: Vec<RollbackFailure>,
}

/// 回滚日志：单次运行私有
#[derive(Debug, Default)]
pub struct RollbackJournal {
    entries: Mutex<Vec<RollbackEntry>>,
}

impl RollbackJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: RollbackEntry) {
        tracing::debug!(
            call_id = %entry.tool_call_id,
            kind = ?entry.kind,
            path = %entry.path.display(),
            "rollback entry recorded"
        );
        self.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// 逆序撤销全部条目并清空日志；空日志上调用是 no-op（undone = 0）
    pub async fn replay_reverse(&self) -> RollbackReport {
        let entries = std::mem::take(&mut *self.lock());
        let mut report = RollbackReport::default();
        for entry in entries.iter().rev() {
            match entry.undo().await {
                Ok(()) => {
                    tracing::info!(path = %entry.path.display(), kind = ?entry.kind, "rolled back");
                    report.undone += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path.display(), error = %e, "rollback failed");
                    report.failures.push(RollbackFailure {
                        tool_call_id: entry.tool_call_id.clone(),
                        path: entry.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RollbackEntry>> {
        // 临界区内没有会 panic 的操作，中毒时直接接管数据
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
