//! TMDB API client
//!
//! Thin JSON proxy to The Movie Database. Search and trending responses are
//! passed through as raw JSON for the API layer to annotate; detail lookups
//! are typed because the request flow needs specific fields.

use serde::Deserialize;
use serde_json::Value;

const TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";

#[derive(Debug, thiserror::Error)]
pub enum TmdbError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// External ids attached to a detail response via `append_to_response`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TmdbExternalIds {
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub tvdb_id: Option<i64>,
}

/// Movie or TV detail response. Movies carry `title`/`release_date`, TV
/// carries `name`/`first_air_date`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TmdbDetails {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub first_air_date: Option<String>,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub number_of_seasons: Option<i32>,
    #[serde(default)]
    pub external_ids: Option<TmdbExternalIds>,
}

impl TmdbDetails {
    /// Title for either kind, falling back like the upstream payloads do.
    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Release year parsed from the date prefix.
    pub fn year(&self) -> Option<i32> {
        self.release_date
            .as_deref()
            .or(self.first_air_date.as_deref())
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse().ok())
    }
}

/// Shared TMDB client.
#[derive(Clone)]
pub struct TmdbClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl TmdbClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, TMDB_BASE_URL)
    }

    pub fn with_base_url(api_key: String, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn request(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, TmdbError> {
        let response = self
            .http
            .get(format!("{}{endpoint}", self.base_url))
            .query(&[("api_key", self.api_key.as_str())])
            .query(params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn search_multi(&self, query: &str, page: u32) -> Result<Value, TmdbError> {
        self.request(
            "/search/multi",
            &[
                ("query", query.to_string()),
                ("page", page.to_string()),
                ("include_adult", "false".to_string()),
            ],
        )
        .await
    }

    pub async fn search_movie(&self, query: &str, page: u32) -> Result<Value, TmdbError> {
        self.request(
            "/search/movie",
            &[("query", query.to_string()), ("page", page.to_string())],
        )
        .await
    }

    pub async fn search_tv(&self, query: &str, page: u32) -> Result<Value, TmdbError> {
        self.request(
            "/search/tv",
            &[("query", query.to_string()), ("page", page.to_string())],
        )
        .await
    }

    pub async fn get_movie(&self, movie_id: i64) -> Result<TmdbDetails, TmdbError> {
        let value = self
            .request(
                &format!("/movie/{movie_id}"),
                &[("append_to_response", "external_ids".to_string())],
            )
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn get_tv(&self, tv_id: i64) -> Result<TmdbDetails, TmdbError> {
        let value = self
            .request(
                &format!("/tv/{tv_id}"),
                &[("append_to_response", "external_ids".to_string())],
            )
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn get_trending(&self, media_type: &str) -> Result<Value, TmdbError> {
        self.request(&format!("/trending/{media_type}/week"), &[]).await
    }
}
