//! 文件检查点存储
//!
//! 布局：`<base>/<session_id>/<step:020>.json`，每个文件是一份完整快照。
//! 写入先落到同目录下的临时文件并 fsync，再 rename 到目标名：
//! 崩溃时要么看到完整的新检查点，要么仍只看到旧的，不存在半写状态。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{
    validate_session_id, Checkpoint, CheckpointError, CheckpointId, CheckpointMeta, CheckpointStore,
};

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_session_id(session_id)?;
        Ok(self.base_path.join(session_id))
    }

    fn checkpoint_file(dir: &Path, step: u64) -> PathBuf {
        dir.join(format!("{step:020}.json"))
    }

    /// 目录下已有的 step（升序）；目录不存在返回空
    async fn steps(&self, session_id: &str) -> Result<Vec<u64>, CheckpointError> {
        let dir = self.session_dir(session_id)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut steps = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(step) = name
                .strip_suffix(".json")
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    async fn read_checkpoint(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = tokio::fs::read_to_string(path).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointId, CheckpointError> {
        checkpoint.verify()?;
        let dir = self.session_dir(&checkpoint.session_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        if let Some(&latest) = self.steps(&checkpoint.session_id).await?.last() {
            if checkpoint.step <= latest {
                return Err(CheckpointError::Conflict {
                    session_id: checkpoint.session_id.clone(),
                    step: checkpoint.step,
                    latest,
                });
            }
        }

        let content = serde_json::to_string_pretty(checkpoint)?;
        let path = Self::checkpoint_file(&dir, checkpoint.step);
        let tmp_path = dir.join(format!(
            ".{}.{}.tmp",
            checkpoint.step,
            uuid::Uuid::new_v4().simple()
        ));

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CheckpointError::Io(e));
        }
        Ok(checkpoint.id())
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.steps(session_id).await?.last() {
            Some(&step) => self.load(session_id, step).await,
            None => Ok(None),
        }
    }

    async fn load(&self, session_id: &str, step: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = Self::checkpoint_file(&self.session_dir(session_id)?, step);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_checkpoint(&path).await.map(Some)
    }

    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let dir = self.session_dir(session_id)?;
        let mut metas = Vec::new();
        for step in self.steps(session_id).await? {
            let checkpoint = Self::read_checkpoint(&Self::checkpoint_file(&dir, step)).await?;
            metas.push(checkpoint.meta());
        }
        Ok(metas)
    }

    async fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        if !tokio::fs::try_exists(&self.base_path).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
