use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::downloader::{DownloadTask, TaskStatus};

pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";
pub const LOCAL_FILE_DELETED: &str = "local file deleted";

/// Default number of failed/cancelled records kept in the history.
pub const DEFAULT_RETENTION: usize = 500;

/// In-memory task map plus its durable JSON file. The single source of truth
/// for task status: queue entries and workers always defer to it.
///
/// One lock guards both the map and the file write, so concurrent workers can
/// never interleave partial writes to the persisted file.
pub struct TaskStore {
    path: PathBuf,
    retention: usize,
    tasks: Mutex<HashMap<String, DownloadTask>>,
}

impl TaskStore {
    pub fn new(path: PathBuf, retention: usize) -> Self {
        Self {
            path,
            retention,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted records. Any task that was `Downloading` or `Queued`
    /// when the process died cannot be trusted to resume and is rewritten to
    /// `Failed`. A missing or malformed file yields an empty store.
    pub fn load(path: PathBuf, retention: usize) -> Self {
        let mut tasks: HashMap<String, DownloadTask> = match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => match serde_json::from_str(&content) {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!("Task file {:?} is malformed ({}), starting with empty history", path, e);
                    HashMap::new()
                }
            },
            Ok(_) => HashMap::new(),
            Err(_) => HashMap::new(),
        };

        let mut interrupted = 0;
        for task in tasks.values_mut() {
            if matches!(task.status, TaskStatus::Downloading | TaskStatus::Queued) {
                task.status = TaskStatus::Failed;
                task.error = Some(INTERRUPTED_BY_RESTART.to_string());
                interrupted += 1;
            }
        }

        if !tasks.is_empty() {
            info!(
                "Loaded {} task records from {:?} ({} marked as interrupted)",
                tasks.len(),
                path,
                interrupted
            );
        }

        Self {
            path,
            retention,
            tasks: Mutex::new(tasks),
        }
    }

    /// Persist the full store. Write failures are logged, never raised: a
    /// failed save must not take down a worker mid-download.
    pub async fn save(&self) {
        let mut tasks = self.tasks.lock().await;
        self.save_locked(&mut tasks);
    }

    fn save_locked(&self, tasks: &mut HashMap<String, DownloadTask>) {
        self.prune_locked(tasks);

        let content = match serde_json::to_string_pretty(&*tasks) {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to serialize task store: {}", e);
                return;
            }
        };

        if let Err(e) = self.write_atomic(&content) {
            error!("Failed to write task file {:?}: {}", self.path, e);
        }
    }

    fn write_atomic(&self, content: &str) -> std::io::Result<()> {
        use std::io::Write;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Drop the oldest failed/cancelled records beyond the retention cap.
    /// Non-terminal records are never pruned.
    fn prune_locked(&self, tasks: &mut HashMap<String, DownloadTask>) {
        let mut prunable: Vec<(String, chrono::DateTime<chrono::Utc>)> = tasks
            .iter()
            .filter(|(_, task)| task.status.is_prunable())
            .map(|(mid, task)| (mid.clone(), task.created_at))
            .collect();

        if prunable.len() <= self.retention {
            return;
        }

        prunable.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = prunable.len() - self.retention;
        info!("Task history over {} failed/cancelled records, pruning {} oldest", self.retention, excess);
        for (mid, _) in prunable.into_iter().take(excess) {
            tasks.remove(&mid);
        }
    }

    /// Enqueue-time overwrite: resets progress, error, quality and retry_at
    /// no matter what the previous record held. Last writer wins.
    pub async fn insert_queued(&self, mid: &str, song_name: &str) {
        let mut tasks = self.tasks.lock().await;
        tasks.insert(mid.to_string(), DownloadTask::queued(song_name));
        self.save_locked(&mut tasks);
    }

    /// Claim a queued task for a worker. Returns false when the record is
    /// missing or no longer `Queued` (cancelled, already claimed by a stale
    /// duplicate entry, etc.), in which case the queue item is dropped.
    pub async fn claim_for_download(&self, mid: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(mid) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Downloading;
                task.retry_at = None;
                self.save_locked(&mut tasks);
                true
            }
            _ => false,
        }
    }

    pub async fn set_quality(&self, mid: &str, quality: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(mid) {
            task.quality = quality.to_string();
            self.save_locked(&mut tasks);
        }
    }

    /// Update progress only when the integer percentage actually changed,
    /// avoiding a file write per chunk.
    pub async fn set_progress(&self, mid: &str, progress: u8) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(mid) {
            if task.progress != progress {
                task.progress = progress;
                self.save_locked(&mut tasks);
            }
        }
    }

    pub async fn complete(&self, mid: &str, file_path: PathBuf, url: String) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(mid) {
            task.status = TaskStatus::Completed;
            task.progress = 100;
            task.error = None;
            task.file_path = Some(file_path);
            task.url = Some(url);
            self.save_locked(&mut tasks);
        }
    }

    /// Transport or resolution failure. Progress is deliberately left at its
    /// last known value; the requeue overwrite resets it to zero.
    pub async fn fail(&self, mid: &str, error: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(mid) {
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.retry_at = None;
            self.save_locked(&mut tasks);
        }
    }

    /// Park a task until the account's rate-limit window ends.
    pub async fn mark_waiting_for_retry(&self, mid: &str, retry_at: i64) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(mid) {
            task.status = TaskStatus::WaitingForRetry;
            task.retry_at = Some(retry_at);
            self.save_locked(&mut tasks);
        }
    }

    /// Cancellation is only honored while the task is still queued; once a
    /// worker has claimed it the current fetch attempt runs to completion.
    pub async fn cancel_if_queued(&self, mid: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(mid) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Cancelled;
                task.error = Some("cancelled by user".to_string());
                self.save_locked(&mut tasks);
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, mid: &str) -> Option<DownloadTask> {
        let mut tasks = self.tasks.lock().await;
        let removed = tasks.remove(mid);
        if removed.is_some() {
            self.save_locked(&mut tasks);
        }
        removed
    }

    /// Demote completed records whose backing file vanished. One save for
    /// the whole batch.
    pub async fn mark_files_lost(&self, mids: &[String]) {
        if mids.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for mid in mids {
            if let Some(task) = tasks.get_mut(mid) {
                task.status = TaskStatus::Failed;
                task.error = Some(LOCAL_FILE_DELETED.to_string());
                task.progress = 0;
                task.file_path = None;
                task.url = None;
            }
        }
        self.save_locked(&mut tasks);
    }

    pub async fn get(&self, mid: &str) -> Option<DownloadTask> {
        self.tasks.lock().await.get(mid).cloned()
    }

    pub async fn status_of(&self, mid: &str) -> Option<TaskStatus> {
        self.tasks.lock().await.get(mid).map(|task| task.status)
    }

    pub async fn snapshot(&self) -> HashMap<String, DownloadTask> {
        self.tasks.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
