use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use tune_vault::config::AppConfig;
use tune_vault::credentials::CredentialStore;
use tune_vault::downloader::manager::DownloadManager;
use tune_vault::downloader::scheduler::CooldownScheduler;
use tune_vault::downloader::store::TaskStore;
use tune_vault::downloader::worker::{WorkerContext, WorkerPool};
use tune_vault::notify::NotificationManager;
use tune_vault::provider::HttpMusicProvider;
use tune_vault::utils::ensure_dir_exists;

#[derive(Parser)]
#[command(name = "tune-vault", version, about = "Music download queue daemon")]
struct Args {
    /// Path to the JSON config file (defaults to the platform config dir).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let config = match AppConfig::load(args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {}, using defaults", e);
            AppConfig::default()
        }
    };

    ensure_dir_exists(&config.data_dir).await?;
    ensure_dir_exists(&config.downloads_dir()).await?;

    let store = Arc::new(TaskStore::load(config.tasks_file(), config.history_retention));
    let credentials = Arc::new(CredentialStore::load(config.credentials_file()));
    let provider = Arc::new(HttpMusicProvider::new(
        &config.resolver_url,
        config.quality_order.clone(),
        Arc::clone(&credentials),
    )?);
    let notifier = Arc::new(NotificationManager::new(config.notification.clone())?);

    let (manager, queue_rx) = DownloadManager::new(Arc::clone(&store));

    let ctx = Arc::new(WorkerContext {
        store: Arc::clone(&store),
        provider,
        credentials,
        notifier,
        client: reqwest::ClientBuilder::new().build()?,
        downloads_dir: config.downloads_dir(),
        retry_interval_secs: config.retry_interval_seconds as i64,
    });
    let pool = WorkerPool::spawn(config.max_concurrent_downloads, queue_rx, ctx);
    let scheduler = CooldownScheduler::spawn(
        manager.clone(),
        Duration::from_secs(config.retry_check_interval_seconds),
    );

    info!(
        "tune-vault running: {} workers, {} tasks in history",
        config.max_concurrent_downloads,
        store.len().await
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    // Stop the producers of re-enqueues first, then drain the workers, and
    // only then write the final snapshot so no in-flight progress update
    // races the last save.
    scheduler.shutdown_and_join().await;
    pool.shutdown_and_join().await;
    store.save().await;
    info!("Final task state saved, bye");

    Ok(())
}
