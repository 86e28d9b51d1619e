//! SQLite 检查点存储（rusqlite，同步调用放在 spawn_blocking 中执行）
//!
//! 表 `checkpoints` 以 (session_id, step) 为主键，一行即一份完整快照；
//! 单事务内完成“最新 step 校验 + 插入”，因此 state 与 log 要么一起提交，要么都不提交。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Checkpoint, CheckpointError, CheckpointId, CheckpointMeta, CheckpointStore};
use crate::core::state::TaskState;
use crate::memory::MessageLog;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    session_id     TEXT    NOT NULL,
    step           INTEGER NOT NULL,
    format_version INTEGER NOT NULL,
    state_json     TEXT    NOT NULL,
    log_json       TEXT    NOT NULL,
    created_at     TEXT    NOT NULL,
    PRIMARY KEY (session_id, step)
);
";

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// 打开（不存在则创建）数据库文件并建表
    pub async fn open(path: &Path) -> Result<Self, CheckpointError> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, CheckpointError> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))??;
        Ok(Self::from_connection(conn))
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CheckpointError::Join("sqlite connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))?
    }
}

/// 单行 → Checkpoint（并做加载校验）
fn row_to_checkpoint(
    session_id: String,
    step: i64,
    format_version: i64,
    state_json: String,
    log_json: String,
    created_at: String,
) -> Result<Checkpoint, CheckpointError> {
    let state: TaskState = serde_json::from_str(&state_json)?;
    let log: MessageLog = serde_json::from_str(&log_json)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| CheckpointError::Corrupt(format!("bad created_at '{created_at}': {e}")))?
        .with_timezone(&Utc);
    let checkpoint = Checkpoint {
        format_version: format_version as u32,
        session_id,
        step: step as u64,
        state,
        log,
        created_at,
    };
    checkpoint.verify()?;
    Ok(checkpoint)
}

type CheckpointRow = (String, i64, i64, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

const SELECT_COLUMNS: &str =
    "SELECT session_id, step, format_version, state_json, log_json, created_at FROM checkpoints";

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointId, CheckpointError> {
        checkpoint.verify()?;
        let session_id = checkpoint.session_id.clone();
        let step = checkpoint.step;
        let format_version = checkpoint.format_version;
        let state_json = serde_json::to_string(&checkpoint.state)?;
        let log_json = serde_json::to_string(&checkpoint.log)?;
        let created_at = checkpoint.created_at.to_rfc3339();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(step) FROM checkpoints WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            if let Some(latest) = latest {
                if step as i64 <= latest {
                    return Err(CheckpointError::Conflict {
                        session_id,
                        step,
                        latest: latest as u64,
                    });
                }
            }
            tx.execute(
                "INSERT INTO checkpoints (session_id, step, format_version, state_json, log_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_id,
                    step as i64,
                    format_version as i64,
                    state_json,
                    log_json,
                    created_at
                ],
            )?;
            tx.commit()?;
            Ok(CheckpointId { session_id, step })
        })
        .await
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY step DESC LIMIT 1"),
                    params![session_id],
                    read_row,
                )
                .optional()?;
            row.map(|(sid, step, v, s, l, at)| row_to_checkpoint(sid, step, v, s, l, at))
                .transpose()
        })
        .await
    }

    async fn load(&self, session_id: &str, step: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE session_id = ?1 AND step = ?2"),
                    params![session_id, step as i64],
                    read_row,
                )
                .optional()?;
            row.map(|(sid, step, v, s, l, at)| row_to_checkpoint(sid, step, v, s, l, at))
                .transpose()
        })
        .await
    }

    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY step ASC"))?;
            let rows = stmt
                .query_map(params![session_id], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(sid, step, v, s, l, at)| row_to_checkpoint(sid, step, v, s, l, at).map(|c| c.meta()))
                .collect()
        })
        .await
    }

    async fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT session_id FROM checkpoints ORDER BY session_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }
}
