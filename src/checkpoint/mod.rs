//! 检查点存储：按会话持久化 TaskState + MessageLog 的完整快照
//!
//! - 每个检查点都是全量快照，恢复时只需加载最新一个，无需重放
//! - 同一会话的 step 严格递增；已写入的检查点永不修改、不删除（保留审计历史）
//! - save 对 (TaskState, MessageLog) 这一对是原子的；返回 Ok 即视为步骤已提交
//!
//! 实现：内存（测试）、文件（临时文件 + rename）、SQLite（rusqlite 事务）。

pub mod file;
pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CheckpointBackend, CheckpointSection};
use crate::core::state::{SessionStatus, TaskState};
use crate::memory::MessageLog;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// 快照格式版本；结构不兼容变更时递增
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint conflict for session {session_id}: step {step} is not after latest {latest}")]
    Conflict {
        session_id: String,
        step: u64,
        latest: u64,
    },

    #[error("Unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),

    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage task failed: {0}")]
    Join(String),
}

/// 检查点键
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    pub session_id: String,
    pub step: u64,
}

/// 不可变的全量快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub session_id: String,
    pub step: u64,
    pub state: TaskState,
    pub log: MessageLog,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(step: u64, state: TaskState, log: MessageLog) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            session_id: state.session_id.clone(),
            step,
            state,
            log,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> CheckpointId {
        CheckpointId {
            session_id: self.session_id.clone(),
            step: self.step,
        }
    }

    pub fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            step: self.step,
            status: self.state.status(),
            current_agent: self.state.current_agent.map(|a| a.as_str().to_string()),
            iteration_count: self.state.iteration_count,
            messages: self.log.len() as u64,
            created_at: self.created_at,
        }
    }

    /// 加载后校验：格式版本、会话 id、状态与日志配对
    pub fn verify(&self) -> Result<(), CheckpointError> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(self.format_version));
        }
        if self.state.session_id != self.session_id {
            return Err(CheckpointError::Corrupt(format!(
                "state belongs to {} but checkpoint is keyed {}",
                self.state.session_id, self.session_id
            )));
        }
        if self.state.log_len != self.log.len() as u64 {
            return Err(CheckpointError::Corrupt(format!(
                "state references {} messages, snapshot holds {}",
                self.state.log_len,
                self.log.len()
            )));
        }
        Ok(())
    }
}

/// 审计历史条目
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: u64,
    pub status: SessionStatus,
    pub current_agent: Option<String>,
    pub iteration_count: u32,
    pub messages: u64,
    pub created_at: DateTime<Utc>,
}

/// 检查点存储接口；按会话键控，无需跨会话协调
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 原子写入；step 必须大于该会话已有的最新 step，否则返回 Conflict
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointId, CheckpointError>;

    /// 最新检查点；会话不存在返回 None
    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// 指定 step 的检查点
    async fn load(&self, session_id: &str, step: u64) -> Result<Option<Checkpoint>, CheckpointError>;

    /// 审计历史（按 step 升序）
    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError>;

    /// 所有会话 id
    async fn sessions(&self) -> Result<Vec<String>, CheckpointError>;
}

/// 会话 id 只允许字母数字、'-'、'_'（文件后端用作目录名）
pub(crate) fn validate_session_id(session_id: &str) -> Result<(), CheckpointError> {
    let ok = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CheckpointError::InvalidSessionId(session_id.to_string()))
    }
}

/// 按配置创建检查点存储
///
/// backend = memory / file / sqlite；file 与 sqlite 使用 path（缺省 data/checkpoints[.db]）
pub async fn create_checkpoint_store(
    cfg: &CheckpointSection,
) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    match cfg.backend {
        CheckpointBackend::Memory => {
            tracing::info!("Using in-memory checkpoint store");
            Ok(Arc::new(InMemoryCheckpointStore::new()))
        }
        CheckpointBackend::File => {
            let path = cfg
                .path
                .clone()
                .unwrap_or_else(|| Path::new("data/checkpoints").to_path_buf());
            tracing::info!("Using file checkpoint store: {:?}", path);
            Ok(Arc::new(FileCheckpointStore::new(path)))
        }
        CheckpointBackend::Sqlite => {
            let path = cfg
                .path
                .clone()
                .unwrap_or_else(|| Path::new("data/checkpoints.db").to_path_buf());
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tracing::info!("Using SQLite checkpoint store: {:?}", path);
            Ok(Arc::new(SqliteCheckpointStore::open(&path).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[test]
    fn test_verify_detects_mismatched_pair() {
        let mut log = MessageLog::new();
        log.append(Message::user("how many BRG-6205-2RS?"));
        let mut state = TaskState::new("s1");
        state.log_len = 1;
        let cp = Checkpoint::new(0, state.clone(), log.clone());
        assert!(cp.verify().is_ok());

        state.log_len = 2;
        let bad = Checkpoint::new(1, state, log);
        assert!(matches!(bad.verify(), Err(CheckpointError::Corrupt(_))));
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("sess_1-a").is_ok());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("").is_err());
    }
}
