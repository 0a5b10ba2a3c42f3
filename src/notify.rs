use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use log::warn;
use reqwest::{Client, ClientBuilder};
use serde_json::json;

use crate::config::NotificationConfig;
use crate::errors::Result;

/// Fire-and-forget completion notifications. Failures are logged, never
/// surfaced to the download path.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_download_complete(&self, song_name: &str, quality: &str);
}

/// Notifier that drops everything, used when no channel is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_download_complete(&self, _song_name: &str, _quality: &str) {}
}

/// Sends completion messages over the configured channels: a generic JSON
/// webhook and/or a Bark push endpoint.
pub struct NotificationManager {
    client: Client,
    config: NotificationConfig,
}

impl NotificationManager {
    pub fn new(config: NotificationConfig) -> Result<Self> {
        let client = ClientBuilder::new().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, config })
    }

    async fn send_webhook(&self, title: &str, message: &str) {
        let webhook = &self.config.webhook;
        if !webhook.enabled || webhook.url.is_empty() {
            return;
        }

        let payload = json!({
            "title": title,
            "message": message,
            "timestamp": chrono::Utc::now().timestamp(),
        });

        let result = self.client.post(&webhook.url).json(&payload).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!("Webhook notification rejected: {}", resp.status()),
            Err(e) => warn!("Webhook notification failed: {}", e),
        }
    }

    async fn send_bark(&self, title: &str, message: &str) {
        let bark = &self.config.bark;
        if !bark.enabled || bark.device_key.is_empty() {
            return;
        }

        let url = format!(
            "{}/{}/{}/{}",
            bark.server_url.trim_end_matches('/'),
            bark.device_key,
            urlencoding::encode(title),
            urlencoding::encode(message),
        );

        let result = self.client.get(&url).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!("Bark notification rejected: {}", resp.status()),
            Err(e) => warn!("Bark notification failed: {}", e),
        }
    }
}

#[async_trait]
impl Notifier for NotificationManager {
    async fn notify_download_complete(&self, song_name: &str, quality: &str) {
        let message = format!(
            "Song downloaded.\n\nName: {}\nQuality: {}\nFinished: {}",
            song_name,
            quality,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
        tokio::join!(
            self.send_webhook("Download complete", &message),
            self.send_bark("Download complete", &message),
        );
    }
}
