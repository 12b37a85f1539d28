// =============================================================================
// Broker auth token cache — single-writer refresh
// =============================================================================
//
// The bearer token is cached on disk with issue/expiry; re-issued when <= 30
// min from expiry. Concurrent callers must not trigger duplicate refreshes —
// guarded here with a `tokio::sync::Mutex` held across the refresh `.await`,
// so a second caller simply waits for the first caller's refresh to land
// instead of racing it (spec §4.3/§5 "single-writer guard").
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::BrokerEnv;

const REFRESH_MARGIN: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCache {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub mode: String,
    pub issued_at: DateTime<Utc>,
}

impl TokenCache {
    fn is_fresh(&self) -> bool {
        let now = Utc::now();
        now < self.expires_at
            && (self.expires_at - now).to_std().unwrap_or_default() > REFRESH_MARGIN
    }
}

/// Disk-backed, single-writer-guarded token cache for one broker session.
pub struct TokenStore {
    path: PathBuf,
    cached: Mutex<Option<TokenCache>>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cached: Mutex::new(None) }
    }

    fn load_from_disk(path: &Path) -> Option<TokenCache> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn save_to_disk(&self, cache: &TokenCache) -> Result<()> {
        let content = serde_json::to_string_pretty(cache)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).context("writing token cache tmp file")?;
        std::fs::rename(&tmp, &self.path).context("renaming token cache into place")?;
        Ok(())
    }

    /// Return a valid access token, refreshing it through `issue` if the
    /// cached one is missing or close to expiry. `issue` is the broker's
    /// token-issuance REST call, injected so this module stays transport-
    /// agnostic.
    pub async fn get_or_refresh<F, Fut>(&self, env: &BrokerEnv, issue: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(String, DateTime<Utc>)>>,
    {
        let mut guard = self.cached.lock().await;

        if guard.is_none() {
            *guard = Self::load_from_disk(&self.path);
        }

        if let Some(cache) = guard.as_ref() {
            if cache.is_fresh() && cache.mode == env.mode.to_string() {
                return Ok(cache.access_token.clone());
            }
        }

        info!(mode = %env.mode, "refreshing broker auth token");
        let (access_token, expires_at) = issue().await.context("issuing broker auth token")?;
        let cache = TokenCache {
            access_token: access_token.clone(),
            expires_at,
            mode: env.mode.to_string(),
            issued_at: Utc::now(),
        };
        self.save_to_disk(&cache)?;
        *guard = Some(cache);
        Ok(access_token)
    }
}
