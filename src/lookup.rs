//! TVDB v4 episode-to-series reverse lookup
//!
//! The TVDB API uses a login flow: POST /login with the API key yields a
//! bearer token valid for a month; we cache it and refresh after 29 days.
//! Every failure mode collapses to `None` - the reconciliation engine treats
//! that as "strategy did not resolve" and moves on. No retries here.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TVDB_BASE_URL: &str = "https://api4.thetvdb.com/v4";
/// Tokens are valid for a month; refresh after 29 days to stay clear.
const TOKEN_LIFETIME_SECONDS: i64 = 29 * 24 * 60 * 60;

/// Seam for the reconciliation engine; tests substitute a stub.
#[async_trait]
pub trait EpisodeLookup: Send + Sync {
    /// Resolve an episode-scoped TVDB id to its series TVDB id.
    async fn series_id_from_episode(&self, episode_tvdb_id: i64) -> Option<i64>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EpisodeResponse {
    #[serde(default)]
    data: Option<EpisodeData>,
}

#[derive(Debug, Deserialize)]
struct EpisodeData {
    #[serde(rename = "seriesId", default)]
    series_id: Option<i64>,
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

/// TVDB API client with bearer-token lifecycle.
pub struct TvdbClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl TvdbClient {
    /// `api_key = None` disables the client; every lookup returns `None`.
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(api_key, TVDB_BASE_URL)
    }

    pub fn with_base_url(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            token: Mutex::new(None),
        }
    }

    async fn login(&self) -> Option<String> {
        let api_key = self.api_key.as_ref()?;
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(&serde_json::json!({ "apikey": api_key }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        let response = match response {
            Ok(r) => r,
            Err(err) => {
                warn!("TVDB login failed: {err}");
                return None;
            }
        };
        match response.json::<LoginResponse>().await {
            Ok(body) => body.data.and_then(|d| d.token),
            Err(err) => {
                warn!("TVDB login returned malformed body: {err}");
                None
            }
        }
    }

    /// Cached bearer token, refreshed when missing or expired.
    async fn bearer_token(&self) -> Option<String> {
        let mut guard = self.token.lock().await;
        let now = Utc::now().timestamp();
        if let Some(cached) = guard.as_ref() {
            if now < cached.expires_at {
                return Some(cached.token.clone());
            }
        }
        let token = self.login().await?;
        *guard = Some(CachedToken {
            token: token.clone(),
            expires_at: now + TOKEN_LIFETIME_SECONDS,
        });
        Some(token)
    }
}

#[async_trait]
impl EpisodeLookup for TvdbClient {
    async fn series_id_from_episode(&self, episode_tvdb_id: i64) -> Option<i64> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/episodes/{episode_tvdb_id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await;
        let response = match response {
            Ok(r) => r,
            Err(err) => {
                warn!("TVDB episode lookup failed: {err}");
                return None;
            }
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("TVDB episode {episode_tvdb_id} not found");
            return None;
        }
        let response = match response.error_for_status() {
            Ok(r) => r,
            Err(err) => {
                warn!("TVDB episode lookup failed: {err}");
                return None;
            }
        };
        match response.json::<EpisodeResponse>().await {
            Ok(body) => body.data.and_then(|d| d.series_id),
            Err(err) => {
                warn!("TVDB episode lookup returned malformed body: {err}");
                None
            }
        }
    }
}
