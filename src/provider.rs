use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::credentials::CredentialStore;
use crate::errors::{AppError, Result};

/// One candidate encoding/bitrate option for a song, tried in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityTier {
    #[serde(rename = "MASTER")]
    Master,
    #[serde(rename = "ATMOS_51")]
    Atmos51,
    #[serde(rename = "ATMOS_2")]
    Atmos2,
    #[serde(rename = "FLAC")]
    Flac,
    #[serde(rename = "OGG_640")]
    Ogg640,
    #[serde(rename = "OGG_320")]
    Ogg320,
    #[serde(rename = "MP3_320")]
    Mp3_320,
    #[serde(rename = "ACC_192")]
    Acc192,
    #[serde(rename = "OGG_192")]
    Ogg192,
    #[serde(rename = "MP3_128")]
    Mp3_128,
    #[serde(rename = "ACC_96")]
    Acc96,
    #[serde(rename = "OGG_96")]
    Ogg96,
    #[serde(rename = "ACC_48")]
    Acc48,
}

impl QualityTier {
    /// Full priority order, best first.
    pub fn default_order() -> Vec<QualityTier> {
        use QualityTier::*;
        vec![
            Master, Atmos51, Atmos2, Flac, Ogg640, Ogg320, Mp3_320, Acc192, Ogg192, Mp3_128,
            Acc96, Ogg96, Acc48,
        ]
    }

    pub fn extension(&self) -> &'static str {
        use QualityTier::*;
        match self {
            Master | Atmos51 | Atmos2 | Flac => ".flac",
            Ogg640 | Ogg320 | Ogg192 | Ogg96 => ".ogg",
            Mp3_320 | Mp3_128 => ".mp3",
            Acc192 | Acc96 | Acc48 => ".m4a",
        }
    }

    /// Display label shown in the task list and notifications.
    pub fn label(&self) -> &'static str {
        use QualityTier::*;
        match self {
            Master => "Master",
            Atmos51 => "Atmos 5.1",
            Atmos2 => "Atmos Stereo",
            Flac => "Lossless",
            Ogg640 => "OGG 640k",
            Ogg320 => "OGG 320k",
            Mp3_320 => "MP3 320k",
            Acc192 => "AAC 192k",
            Ogg192 => "OGG 192k",
            Mp3_128 => "MP3 128k",
            Acc96 => "AAC 96k",
            Ogg96 => "OGG 96k",
            Acc48 => "AAC 48k",
        }
    }

    fn api_name(&self) -> &'static str {
        use QualityTier::*;
        match self {
            Master => "MASTER",
            Atmos51 => "ATMOS_51",
            Atmos2 => "ATMOS_2",
            Flac => "FLAC",
            Ogg640 => "OGG_640",
            Ogg320 => "OGG_320",
            Mp3_320 => "MP3_320",
            Acc192 => "ACC_192",
            Ogg192 => "OGG_192",
            Mp3_128 => "MP3_128",
            Acc96 => "ACC_96",
            Ogg96 => "OGG_96",
            Acc48 => "ACC_48",
        }
    }
}

/// A live download URL together with the tier that produced it.
#[derive(Debug, Clone)]
pub struct ResolvedUrl {
    pub url: String,
    pub tier: QualityTier,
}

/// Resolves a song mid to a download URL, or `None` when every tier comes
/// back empty (treated upstream as an account-wide rate limit).
#[async_trait]
pub trait MusicProvider: Send + Sync {
    async fn resolve_download_url(&self, song_mid: &str) -> Result<Option<ResolvedUrl>>;
}

#[derive(Deserialize)]
struct ResolveResponse {
    url: Option<String>,
}

/// Provider backed by an upstream resolver endpoint. Each quality tier is
/// queried in priority order; the first tier that yields a live URL wins.
pub struct HttpMusicProvider {
    client: Client,
    resolver_url: Url,
    tiers: Vec<QualityTier>,
    credentials: Arc<CredentialStore>,
}

impl HttpMusicProvider {
    pub fn new(
        resolver_url: &str,
        tiers: Vec<QualityTier>,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self> {
        let resolver_url = Url::parse(resolver_url)
            .map_err(|e| AppError::Config(format!("invalid resolver URL: {}", e)))?;
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            resolver_url,
            tiers,
            credentials,
        })
    }
}

#[async_trait]
impl MusicProvider for HttpMusicProvider {
    async fn resolve_download_url(&self, song_mid: &str) -> Result<Option<ResolvedUrl>> {
        if !self.credentials.is_authenticated().await {
            return Err(AppError::NotAuthenticated);
        }

        for &tier in &self.tiers {
            let response = self
                .client
                .get(self.resolver_url.clone())
                .query(&[("mid", song_mid), ("type", tier.api_name())])
                .send()
                .await;

            let body: ResolveResponse = match response {
                Ok(resp) if resp.status().is_success() => match resp.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("tier {}: bad resolver response: {}", tier.api_name(), e);
                        continue;
                    }
                },
                Ok(resp) => {
                    debug!("tier {}: resolver returned {}", tier.api_name(), resp.status());
                    continue;
                }
                Err(e) => {
                    warn!("tier {}: resolver request failed: {}", tier.api_name(), e);
                    continue;
                }
            };

            match body.url {
                Some(url) if url.starts_with("http") => {
                    debug!("resolved {} at tier {}", song_mid, tier.label());
                    return Ok(Some(ResolvedUrl { url, tier }));
                }
                _ => continue,
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_order_starts_with_best_quality() {
        let order = QualityTier::default_order();
        assert_eq!(order.first(), Some(&QualityTier::Master));
        assert_eq!(order.last(), Some(&QualityTier::Acc48));
        assert_eq!(order.len(), 13);
    }

    #[test]
    fn tier_serializes_with_api_names() {
        let json = serde_json::to_string(&QualityTier::Atmos51).unwrap();
        assert_eq!(json, "\"ATMOS_51\"");
        let tier: QualityTier = serde_json::from_str("\"OGG_640\"").unwrap();
        assert_eq!(tier, QualityTier::Ogg640);
    }

    #[test]
    fn lossless_tiers_map_to_flac_extension() {
        assert_eq!(QualityTier::Master.extension(), ".flac");
        assert_eq!(QualityTier::Mp3_128.extension(), ".mp3");
        assert_eq!(QualityTier::Acc192.extension(), ".m4a");
    }
}
