use std::fs;
use std::path::PathBuf;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// On-disk credential state for the single active account. Besides the
/// opaque login fields this carries the shared rate-limit window: resolution
/// failures across all quality tiers push `cooldown_until` into the future,
/// and any successful resolution clears it again.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CredentialData {
    musicid: Option<String>,
    musickey: Option<String>,
    #[serde(default)]
    cooldown_until: i64,
}

impl CredentialData {
    fn is_complete(&self) -> bool {
        matches!(&self.musicid, Some(id) if !id.is_empty())
            && matches!(&self.musickey, Some(key) if !key.is_empty())
    }
}

pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<CredentialData>,
}

impl CredentialStore {
    /// Load the credential file, falling back to an empty (unauthenticated)
    /// state when the file is missing or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let state = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CredentialData>(&content) {
                Ok(data) => {
                    if data.is_complete() {
                        info!("Loaded credential from {:?}", path);
                    } else {
                        warn!("Credential file {:?} is incomplete, treating as logged out", path);
                    }
                    data
                }
                Err(e) => {
                    warn!("Credential file {:?} is malformed ({}), treating as logged out", path, e);
                    CredentialData::default()
                }
            },
            Err(_) => CredentialData::default(),
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.is_complete()
    }

    pub async fn cooldown_until(&self) -> i64 {
        self.state.lock().await.cooldown_until
    }

    /// Record a rate-limit hit. If an earlier cooldown window is still open
    /// it is left untouched so concurrent workers cannot extend it
    /// indefinitely; otherwise a new window of `interval_secs` starts at
    /// `now`. Returns the effective end of the window either way.
    pub async fn note_rate_limited(&self, now: i64, interval_secs: i64) -> i64 {
        let mut state = self.state.lock().await;
        if state.cooldown_until > now {
            return state.cooldown_until;
        }
        state.cooldown_until = now + interval_secs;
        self.persist(&state);
        state.cooldown_until
    }

    /// A successful URL resolution proves the account is no longer limited,
    /// regardless of which task triggered it.
    pub async fn note_resolution_success(&self) {
        let mut state = self.state.lock().await;
        if state.cooldown_until != 0 {
            state.cooldown_until = 0;
            self.persist(&state);
        }
    }

    fn persist(&self, state: &CredentialData) {
        let content = match serde_json::to_string_pretty(state) {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to serialize credential state: {}", e);
                return;
            }
        };
        if let Err(e) = fs::write(&self.path, content) {
            error!("Failed to write credential file {:?}: {}", self.path, e);
        }
    }

    #[cfg(test)]
    pub async fn set_test_credential(&self, musicid: &str, musickey: &str) {
        let mut state = self.state.lock().await;
        state.musicid = Some(musicid.to_string());
        state.musickey = Some(musickey.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_means_logged_out() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("credentials.json"));
        assert!(!store.is_authenticated().await);
        assert_eq!(store.cooldown_until().await, 0);
    }

    #[tokio::test]
    async fn malformed_file_means_logged_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();
        let store = CredentialStore::load(path);
        assert!(!store.is_authenticated().await);
    }

    #[tokio::test]
    async fn rate_limit_window_is_not_extended_while_open() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("credentials.json"));

        let first = store.note_rate_limited(1_000, 600).await;
        assert_eq!(first, 1_600);

        // A second failure inside the window leaves it unchanged.
        let second = store.note_rate_limited(1_200, 600).await;
        assert_eq!(second, 1_600);

        // After the window has elapsed a fresh one opens.
        let third = store.note_rate_limited(2_000, 600).await;
        assert_eq!(third, 2_600);
    }

    #[tokio::test]
    async fn resolution_success_clears_cooldown() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("credentials.json"));

        store.note_rate_limited(1_000, 600).await;
        store.note_resolution_success().await;
        assert_eq!(store.cooldown_until().await, 0);
    }

    #[tokio::test]
    async fn cooldown_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::load(path.clone());
        store.note_rate_limited(1_000, 600).await;
        drop(store);

        let reloaded = CredentialStore::load(path);
        assert_eq!(reloaded.cooldown_until().await, 1_600);
    }
}
