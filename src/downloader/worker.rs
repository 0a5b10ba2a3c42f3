use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::credentials::CredentialStore;
use crate::downloader::store::TaskStore;
use crate::downloader::QueueItem;
use crate::errors::{AppError, Result};
use crate::notify::Notifier;
use crate::provider::{MusicProvider, ResolvedUrl};
use crate::utils::sanitize_filename;

/// Everything a worker needs to run the per-task download protocol.
pub struct WorkerContext {
    pub store: Arc<TaskStore>,
    pub provider: Arc<dyn MusicProvider>,
    pub credentials: Arc<CredentialStore>,
    pub notifier: Arc<dyn Notifier>,
    pub client: reqwest::Client,
    pub downloads_dir: PathBuf,
    /// Cooldown window length after a rate-limit hit, in seconds.
    pub retry_interval_secs: i64,
}

/// Fixed pool of long-lived download workers. Concurrency comes purely from
/// running several workers; a single worker never overlaps two tasks.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue_rx: mpsc::UnboundedReceiver<QueueItem>,
        ctx: Arc<WorkerContext>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(Mutex::new(queue_rx));

        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&ctx);
            let mut shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, ctx, &mut shutdown_rx).await;
            }));
        }
        info!("Started {} download workers", count);

        Self { shutdown_tx, handles }
    }

    /// Stop pulling from the queue and wait for every worker. In-flight
    /// transfers run to completion; nothing is aborted mid-stream.
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("All download workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
    ctx: Arc<WorkerContext>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let item = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            item = next_item(&queue) => match item {
                Some(item) => item,
                // Queue closed: all producers are gone.
                None => break,
            },
        };
        let (mid, song_name) = item;

        // Queue entries are advisory; the store decides. A missing,
        // cancelled or already-claimed record drops the entry here.
        if !ctx.store.claim_for_download(&mid).await {
            debug!("worker-{}: skipping {}, no longer queued", worker_id, song_name);
            continue;
        }

        info!("worker-{}: downloading {}", worker_id, song_name);
        if let Err(e) = execute_download(&ctx, &mid, &song_name).await {
            // Keep the loop alive no matter what one task did.
            error!("worker-{}: {} failed: {}", worker_id, song_name, e);
            ctx.store.fail(&mid, &e.to_string()).await;
        }
    }
}

async fn next_item(queue: &Mutex<mpsc::UnboundedReceiver<QueueItem>>) -> Option<QueueItem> {
    queue.lock().await.recv().await
}

/// The per-task protocol: credential gate, tier-ordered URL resolution,
/// cooldown bookkeeping, streaming fetch, terminal status write.
async fn execute_download(ctx: &WorkerContext, mid: &str, song_name: &str) -> Result<()> {
    if !ctx.credentials.is_authenticated().await {
        // Cooldown only makes sense for an authenticated account, so this
        // is a plain failure with no rate-limit side effect.
        ctx.store.fail(mid, &AppError::NotAuthenticated.to_string()).await;
        return Ok(());
    }

    let resolved = match ctx.provider.resolve_download_url(mid).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => {
            rate_limited(ctx, mid, song_name).await;
            return Ok(());
        }
        Err(e) => {
            warn!("URL resolution for {} errored: {}", song_name, e);
            ctx.store.fail(mid, &e.to_string()).await;
            return Ok(());
        }
    };

    // A working URL proves the account-wide limit is over, whichever task
    // hit it originally.
    ctx.credentials.note_resolution_success().await;
    ctx.store.set_quality(mid, resolved.tier.label()).await;

    tokio::fs::create_dir_all(&ctx.downloads_dir).await?;
    let file_name = format!("{}{}", sanitize_filename(song_name), resolved.tier.extension());
    let file_path = ctx.downloads_dir.join(&file_name);

    match stream_to_file(ctx, mid, &resolved, &file_path).await {
        Ok(()) => {
            let public_url = format!("/downloads/{}", file_name);
            ctx.store.complete(mid, file_path, public_url).await;
            info!("Download completed: {} ({})", song_name, resolved.tier.label());

            let notifier = Arc::clone(&ctx.notifier);
            let song_name = song_name.to_string();
            let quality = resolved.tier.label().to_string();
            tokio::spawn(async move {
                notifier.notify_download_complete(&song_name, &quality).await;
            });
        }
        Err(e) => {
            warn!("Download failed: {}: {}", song_name, e);
            ctx.store.fail(mid, &e.to_string()).await;
        }
    }

    Ok(())
}

/// No tier produced a URL: treat as a shared rate limit on the credential,
/// not a per-song failure, and park the task until the window ends.
async fn rate_limited(ctx: &WorkerContext, mid: &str, song_name: &str) {
    let now = Utc::now().timestamp();
    let retry_at = ctx
        .credentials
        .note_rate_limited(now, ctx.retry_interval_secs)
        .await;
    info!(
        "No download URL for {} on any tier, retrying after cooldown ({}s away)",
        song_name,
        retry_at.saturating_sub(now)
    );
    ctx.store.mark_waiting_for_retry(mid, retry_at).await;
}

async fn stream_to_file(
    ctx: &WorkerContext,
    mid: &str,
    resolved: &ResolvedUrl,
    file_path: &PathBuf,
) -> Result<()> {
    let response = ctx
        .client
        .get(&resolved.url)
        .timeout(Duration::from_secs(300))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(AppError::Download(format!("HTTP error: {}", response.status())));
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(file_path).await?;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if total_size > 0 {
            let progress = ((downloaded * 100) / total_size).min(100) as u8;
            // The store drops no-op updates, so this only writes when the
            // integer percentage moves.
            ctx.store.set_progress(mid, progress).await;
        }
    }

    file.flush().await?;
    Ok(())
}
