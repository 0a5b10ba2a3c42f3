pub mod manager;
pub mod scheduler;
pub mod store;
pub mod worker;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
    WaitingForRetry,
}

impl TaskStatus {
    /// Statuses subject to history pruning. `Completed` is terminal too but
    /// is kept so the task list can keep serving the download link.
    pub fn is_prunable(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// One record per song mid; re-enqueueing overwrites the previous record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub status: TaskStatus,
    pub song_name: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Epoch seconds; present only while `WaitingForRetry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<i64>,
    /// Insertion time, used for oldest-first history pruning.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn queued(song_name: &str) -> Self {
        Self {
            status: TaskStatus::Queued,
            song_name: song_name.to_string(),
            quality: String::new(),
            progress: 0,
            error: None,
            file_path: None,
            url: None,
            retry_at: None,
            created_at: Utc::now(),
        }
    }
}

/// (song mid, display name) as buffered on the queue. Queue entries are
/// advisory; the store is authoritative at dequeue time.
pub type QueueItem = (String, String);
