use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::downloader::store::TaskStore;
use crate::downloader::{QueueItem, TaskStatus};
use crate::errors::{AppError, Result};

/// Producer-facing facade over the task store and the download queue. All
/// external callers (status endpoints, monitors, the retry scheduler) go
/// through this one enqueue entry point.
///
/// Cheap to clone; clones share the same store and queue.
#[derive(Clone)]
pub struct DownloadManager {
    store: Arc<TaskStore>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
}

impl DownloadManager {
    /// Build the manager plus the consumer end of the queue, which the
    /// worker pool takes ownership of.
    pub fn new(store: Arc<TaskStore>) -> (Self, mpsc::UnboundedReceiver<QueueItem>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        (Self { store, queue_tx }, queue_rx)
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Unconditionally (re)create the task record as queued, persist, then
    /// buffer the item for the workers. Last writer wins; a stale queue
    /// entry for the same mid is dropped at claim time.
    pub async fn enqueue(&self, mid: &str, song_name: &str) {
        self.store.insert_queued(mid, song_name).await;
        if self.queue_tx.send((mid.to_string(), song_name.to_string())).is_err() {
            warn!("Download queue is closed, {} will be recovered on next start", song_name);
        }
    }

    /// Cancel a task, honored only while it is still queued.
    pub async fn cancel(&self, mid: &str) -> bool {
        self.store.cancel_if_queued(mid).await
    }

    /// Manual retry of a single failed task.
    pub async fn retry(&self, mid: &str) -> Result<()> {
        let task = self
            .store
            .get(mid)
            .await
            .ok_or_else(|| AppError::Task(format!("no such task: {}", mid)))?;
        if task.status != TaskStatus::Failed {
            return Err(AppError::Task("only failed tasks can be retried".to_string()));
        }
        self.enqueue(mid, &task.song_name).await;
        Ok(())
    }

    /// Re-enqueue every failed task. Returns the number requeued.
    pub async fn retry_all_failed(&self) -> usize {
        let failed: Vec<(String, String)> = self
            .store
            .snapshot()
            .await
            .into_iter()
            .filter(|(_, task)| task.status == TaskStatus::Failed)
            .map(|(mid, task)| (mid, task.song_name))
            .collect();

        for (mid, song_name) in &failed {
            self.enqueue(mid, song_name).await;
        }
        if !failed.is_empty() {
            info!("Requeued {} failed downloads", failed.len());
        }
        failed.len()
    }

    pub async fn remove(&self, mid: &str) -> bool {
        self.store.remove(mid).await.is_some()
    }

    /// Remove a batch of tasks, optionally deleting completed files from
    /// disk. Returns (records removed, files deleted).
    pub async fn remove_many(&self, mids: &[String], delete_files: bool) -> (usize, usize) {
        let mut removed = 0;
        let mut deleted = 0;
        for mid in mids {
            let Some(task) = self.store.remove(mid).await else {
                continue;
            };
            removed += 1;
            if delete_files {
                if let Some(path) = &task.file_path {
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => deleted += 1,
                        Err(e) => warn!("Failed to delete {:?}: {}", path, e),
                    }
                }
            }
        }
        (removed, deleted)
    }

    /// Full task map for the status read.
    pub async fn snapshot(&self) -> std::collections::HashMap<String, crate::downloader::DownloadTask> {
        self.store.snapshot().await
    }

    /// Demote completed tasks whose backing file no longer exists. Called by
    /// the status read path so the list never advertises dead links.
    pub async fn reconcile_completed_files(&self) -> usize {
        let lost: Vec<String> = self
            .store
            .snapshot()
            .await
            .into_iter()
            .filter(|(_, task)| {
                task.status == TaskStatus::Completed
                    && task.file_path.as_ref().is_some_and(|path| !path.exists())
            })
            .map(|(mid, _)| mid)
            .collect();

        if !lost.is_empty() {
            info!("{} completed downloads lost their local file, demoting to failed", lost.len());
            self.store.mark_files_lost(&lost).await;
        }
        lost.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::store::{DEFAULT_RETENTION, LOCAL_FILE_DELETED};
    use tempfile::tempdir;

    fn manager_in(dir: &tempfile::TempDir) -> (DownloadManager, mpsc::UnboundedReceiver<QueueItem>) {
        let store = Arc::new(TaskStore::new(
            dir.path().join("download_tasks.json"),
            DEFAULT_RETENTION,
        ));
        DownloadManager::new(store)
    }

    #[tokio::test]
    async fn double_enqueue_leaves_one_queued_record() {
        let dir = tempdir().unwrap();
        let (manager, mut queue_rx) = manager_in(&dir);

        manager.enqueue("x", "Song X").await;
        manager.enqueue("x", "Song X").await;

        assert_eq!(manager.store().len().await, 1);
        assert_eq!(manager.store().status_of("x").await, Some(TaskStatus::Queued));

        // Two queue entries exist, but only the first claim succeeds.
        let (first, _) = queue_rx.recv().await.unwrap();
        let (second, _) = queue_rx.recv().await.unwrap();
        assert_eq!(first, "x");
        assert_eq!(second, "x");
        assert!(manager.store().claim_for_download(&first).await);
        assert!(!manager.store().claim_for_download(&second).await);
    }

    #[tokio::test]
    async fn retry_is_limited_to_failed_tasks() {
        let dir = tempdir().unwrap();
        let (manager, _queue_rx) = manager_in(&dir);

        assert!(manager.retry("ghost").await.is_err());

        manager.enqueue("x", "Song X").await;
        assert!(manager.retry("x").await.is_err());

        manager.store().claim_for_download("x").await;
        manager.store().fail("x", "boom").await;
        manager.retry("x").await.unwrap();
        assert_eq!(manager.store().status_of("x").await, Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn retry_all_failed_requeues_each_failed_task() {
        let dir = tempdir().unwrap();
        let (manager, _queue_rx) = manager_in(&dir);

        for mid in ["a", "b"] {
            manager.enqueue(mid, mid).await;
            manager.store().claim_for_download(mid).await;
            manager.store().fail(mid, "boom").await;
        }
        manager.enqueue("c", "c").await;

        assert_eq!(manager.retry_all_failed().await, 2);
        for mid in ["a", "b", "c"] {
            assert_eq!(manager.store().status_of(mid).await, Some(TaskStatus::Queued));
        }
    }

    #[tokio::test]
    async fn reconcile_demotes_tasks_with_missing_files() {
        let dir = tempdir().unwrap();
        let (manager, _queue_rx) = manager_in(&dir);

        let kept = dir.path().join("kept.flac");
        std::fs::write(&kept, b"flac").unwrap();

        manager.enqueue("kept", "Kept").await;
        manager.store().claim_for_download("kept").await;
        manager.store().complete("kept", kept, "/downloads/kept.flac".into()).await;

        manager.enqueue("lost", "Lost").await;
        manager.store().claim_for_download("lost").await;
        manager
            .store()
            .complete("lost", dir.path().join("lost.flac"), "/downloads/lost.flac".into())
            .await;

        assert_eq!(manager.reconcile_completed_files().await, 1);
        assert_eq!(manager.store().status_of("kept").await, Some(TaskStatus::Completed));
        let lost = manager.store().get("lost").await.unwrap();
        assert_eq!(lost.status, TaskStatus::Failed);
        assert_eq!(lost.error.as_deref(), Some(LOCAL_FILE_DELETED));
    }

    #[tokio::test]
    async fn remove_many_can_delete_files() {
        let dir = tempdir().unwrap();
        let (manager, _queue_rx) = manager_in(&dir);

        let path = dir.path().join("song.flac");
        std::fs::write(&path, b"flac").unwrap();
        manager.enqueue("x", "Song X").await;
        manager.store().claim_for_download("x").await;
        manager.store().complete("x", path.clone(), "/downloads/song.flac".into()).await;

        let (removed, deleted) = manager.remove_many(&["x".to_string(), "ghost".to_string()], true).await;
        assert_eq!((removed, deleted), (1, 1));
        assert!(!path.exists());
        assert_eq!(manager.store().len().await, 0);
    }
}
