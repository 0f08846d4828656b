//! Application configuration - environment variables and defaults
//!
//! All application secrets and knobs come from a fixed set of environment
//! variables (optionally via `.env`):
//!
//! - `APP_SECRET_KEY` - session token signing secret
//! - `PRESHARED_PASSWORD` - the shared user password
//! - `TMDB_API_KEY` - metadata catalog access
//! - `FEED_TOKEN` - optional guard for the Radarr/Sonarr/RSS feeds
//! - `PLEX_WEBHOOK_TOKEN` - guard for webhook and sync ingress
//! - `PLEX_SERVER_NAME` - optional webhook server filter
//! - `TVDB_API_KEY` - optional episode reverse lookup
//! - `VAPID_PRIVATE_KEY` / `VAPID_PUBLIC_KEY` - Web Push signing
//! - `RATE_LIMIT_ENABLED` / `RATE_LIMIT_MAX_ATTEMPTS` / `RATE_LIMIT_WINDOW_SECONDS`
//! - `ALLOWED_ORIGIN` - CORS origin (permissive when unset)
//! - `BASE_URL` - public URL used in feed links and the VAPID subject

use tracing::warn;

use crate::auth::RateLimitConfig;

/// Application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub app_secret_key: String,
    pub preshared_password: String,
    pub tmdb_api_key: String,
    pub feed_token: Option<String>,
    pub plex_webhook_token: Option<String>,
    pub plex_server_name: Option<String>,
    pub tvdb_api_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub vapid_public_key: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub allowed_origin: Option<String>,
    pub base_url: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    match env_opt(key) {
        Some(value) => Ok(value),
        None => {
            if cfg!(debug_assertions) {
                warn!("{key} not set, using dev placeholder - do NOT use in production");
                Ok(format!("dev-{}", key.to_lowercase()))
            } else {
                anyhow::bail!("{key} environment variable is not set")
            }
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment.
    ///
    /// The three core secrets are mandatory in release builds; debug builds
    /// fall back to dev placeholders with a warning.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut rate_limit = RateLimitConfig::default();
        if let Some(v) = env_opt("RATE_LIMIT_ENABLED") {
            rate_limit.enabled = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = env_opt("RATE_LIMIT_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                rate_limit.max_attempts = n;
            }
        }
        if let Some(v) = env_opt("RATE_LIMIT_WINDOW_SECONDS") {
            if let Ok(n) = v.parse() {
                rate_limit.window_seconds = n;
            }
        }

        Ok(Self {
            app_secret_key: env_required("APP_SECRET_KEY")?,
            preshared_password: env_required("PRESHARED_PASSWORD")?,
            tmdb_api_key: env_required("TMDB_API_KEY")?,
            feed_token: env_opt("FEED_TOKEN"),
            plex_webhook_token: env_opt("PLEX_WEBHOOK_TOKEN"),
            plex_server_name: env_opt("PLEX_SERVER_NAME"),
            tvdb_api_key: env_opt("TVDB_API_KEY"),
            vapid_private_key: env_opt("VAPID_PRIVATE_KEY"),
            vapid_public_key: env_opt("VAPID_PUBLIC_KEY"),
            rate_limit,
            allowed_origin: env_opt("ALLOWED_ORIGIN"),
            base_url: env_opt("BASE_URL"),
        })
    }

    /// VAPID `sub` claim: derived from BASE_URL's host when available.
    pub fn vapid_subject(&self) -> String {
        let host = self
            .base_url
            .as_deref()
            .and_then(|url| reqwest::Url::parse(url).ok())
            .and_then(|url| url.host_str().map(String::from));
        match host {
            Some(host) => format!("mailto:admin@{host}"),
            None => "mailto:admin@localhost".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vapid_subject_follows_base_url() {
        let config = AppConfig {
            base_url: Some("https://requests.example.com/app".into()),
            ..Default::default()
        };
        assert_eq!(config.vapid_subject(), "mailto:admin@requests.example.com");

        let config = AppConfig::default();
        assert_eq!(config.vapid_subject(), "mailto:admin@localhost");
    }
}
