use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::downloader::manager::DownloadManager;
use crate::downloader::TaskStatus;

/// Periodic ticker that re-enqueues tasks whose rate-limit cooldown has
/// elapsed. Polling is deliberate: pending tasks are few, so "elapsed" only
/// needs to be accurate to within one tick.
pub struct CooldownScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CooldownScheduler {
    pub fn spawn(manager: DownloadManager, tick: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let requeued = requeue_elapsed(&manager, Utc::now().timestamp()).await;
                        if requeued > 0 {
                            info!("Cooldown elapsed for {} tasks, requeued", requeued);
                        } else {
                            debug!("Cooldown scan found nothing to requeue");
                        }
                    }
                }
            }
        });
        info!("Started cooldown scheduler (tick every {:?})", tick);

        Self { shutdown_tx, handle }
    }

    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// One scan: every `waiting_for_retry` task with `retry_at <= now` goes back
/// through the enqueue API (which resets it to queued). Takes `now` as a
/// parameter so tests can drive the scan directly.
pub async fn requeue_elapsed(manager: &DownloadManager, now: i64) -> usize {
    let due: Vec<(String, String)> = manager
        .snapshot()
        .await
        .into_iter()
        .filter(|(_, task)| {
            task.status == TaskStatus::WaitingForRetry
                && task.retry_at.is_some_and(|retry_at| retry_at <= now)
        })
        .map(|(mid, task)| (mid, task.song_name))
        .collect();

    for (mid, song_name) in &due {
        manager.enqueue(mid, song_name).await;
    }
    due.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::store::{TaskStore, DEFAULT_RETENTION};
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn park(store: &TaskStore, mid: &str, retry_at: i64) {
        store.insert_queued(mid, mid).await;
        store.claim_for_download(mid).await;
        store.mark_waiting_for_retry(mid, retry_at).await;
    }

    #[tokio::test]
    async fn scan_requeues_only_elapsed_retries() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::new(
            dir.path().join("download_tasks.json"),
            DEFAULT_RETENTION,
        ));
        let (manager, mut queue_rx) = DownloadManager::new(Arc::clone(&store));

        park(&store, "due", 1_000).await;
        park(&store, "later", 2_000).await;
        store.insert_queued("unrelated", "unrelated").await;
        store.claim_for_download("unrelated").await;
        store.fail("unrelated", "boom").await;

        assert_eq!(requeue_elapsed(&manager, 1_500).await, 1);
        assert_eq!(store.status_of("due").await, Some(TaskStatus::Queued));
        assert_eq!(store.status_of("later").await, Some(TaskStatus::WaitingForRetry));
        // Plain failures are left for manual retry.
        assert_eq!(store.status_of("unrelated").await, Some(TaskStatus::Failed));

        let (mid, _) = queue_rx.recv().await.unwrap();
        assert_eq!(mid, "due");
    }

    #[tokio::test]
    async fn scan_is_idempotent_once_requeued() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::new(
            dir.path().join("download_tasks.json"),
            DEFAULT_RETENTION,
        ));
        let (manager, _queue_rx) = DownloadManager::new(Arc::clone(&store));

        park(&store, "due", 1_000).await;
        assert_eq!(requeue_elapsed(&manager, 1_500).await, 1);
        // Requeueing cleared retry_at, so the next scan finds nothing.
        assert_eq!(requeue_elapsed(&manager, 1_500).await, 0);
    }

    #[tokio::test]
    async fn ticker_picks_up_elapsed_tasks_within_one_tick() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::new(
            dir.path().join("download_tasks.json"),
            DEFAULT_RETENTION,
        ));
        let (manager, _queue_rx) = DownloadManager::new(Arc::clone(&store));

        park(&store, "due", Utc::now().timestamp() - 10).await;

        let scheduler = CooldownScheduler::spawn(manager, Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.status_of("due").await == Some(TaskStatus::Queued) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scheduler should requeue the elapsed task");
        scheduler.shutdown_and_join().await;
    }
}
