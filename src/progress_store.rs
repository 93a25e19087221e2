//! Durable, resumable progress tracking for the transfer engine.
//!
//! Progress is persisted as JSON. Writes go to a temp file in the same
//! directory followed by a rename, so a crash mid-write can never leave a
//! truncated or partially-written progress file behind.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Result, TransferError};
use crate::models::ProgressRecord;

pub struct ProgressStore {
    path: PathBuf,
    record: ProgressRecord,
    last_flush: Instant,
}

impl ProgressStore {
    /// Load an existing progress file, or start a fresh one if none exists.
    ///
    /// A missing, unreadable, or corrupt file is never fatal: it is logged
    /// and replaced by a fresh empty record so a damaged progress file can
    /// never block a run from starting (it can only cost re-transferring
    /// messages the damaged file had already recorded).
    pub async fn load(path: &Path) -> Result<Self> {
        let record = if path.exists() {
            match Self::read_record(path).await {
                Ok(record) => {
                    tracing::info!(
                        "Resumed progress: session_id={}, completed_labels={}",
                        record.session_id,
                        record.completed_labels
                    );
                    record
                }
                Err(e) => {
                    tracing::error!(
                        "Progress file {:?} is corrupt or unreadable ({}), starting a fresh record",
                        path,
                        e
                    );
                    ProgressRecord::new(uuid::Uuid::new_v4().to_string())
                }
            }
        } else {
            let session_id = uuid::Uuid::new_v4().to_string();
            tracing::info!("No progress file found at {:?}, starting session {}", path, session_id);
            ProgressRecord::new(session_id)
        };

        Ok(Self {
            path: path.to_path_buf(),
            record,
            last_flush: Instant::now(),
        })
    }

    async fn read_record(path: &Path) -> Result<ProgressRecord> {
        let content = tokio::fs::read_to_string(path).await?;
        let record: ProgressRecord = serde_json::from_str(&content).map_err(|e| {
            TransferError::ProgressStoreError(format!(
                "Failed to parse progress file {:?}: {}",
                path, e
            ))
        })?;
        Ok(record)
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut ProgressRecord {
        &mut self.record
    }

    /// Atomically persist the current progress record: write to a temp file
    /// in the same directory, then rename over the destination.
    pub async fn save(&mut self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.record)?;

        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.tmp_path();
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        self.last_flush = Instant::now();
        tracing::debug!("Saved progress to {:?}", self.path);
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "progress.json".into());
        name.push(".tmp");
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
            _ => PathBuf::from(name),
        }
    }

    /// Save if `force` is set or the flush interval has elapsed since the
    /// last save. Called after every upload so progress survives a crash
    /// without flushing to disk on every single message.
    pub async fn save_if_due(&mut self, force: bool, flush_interval: Duration) -> Result<()> {
        if force || self.last_flush.elapsed() >= flush_interval {
            self.save().await?;
        }
        Ok(())
    }

    pub fn is_message_transferred(&self, label_id: &str, message_id: &str) -> bool {
        self.record.is_message_transferred(label_id, message_id)
    }

    pub fn mark_message_transferred(&mut self, label_id: &str, message_id: &str) {
        self.record.mark_message_transferred(label_id, message_id);
    }

    pub fn record_known_message_ids(&mut self, label_id: &str, ids: Vec<String>) {
        self.record.record_known_message_ids(label_id, ids);
    }

    pub fn is_label_completed(&self, label_id: &str) -> bool {
        self.record.is_label_completed(label_id)
    }

    pub fn mark_label_completed(&mut self, label_id: &str) {
        self.record.mark_label_completed(label_id);
    }

    pub fn set_current_label(&mut self, label_id: Option<String>) {
        self.record.current_label = label_id;
    }
}
