//! Downstream list and feed endpoints for Radarr/Sonarr
//!
//! The JSON shapes are interop contracts:
//! - Radarr (StevenLu custom list): `[{"title", "imdb_id"?, "poster_url"?}]`
//! - Sonarr (custom list): `[{"tvdbId": "<string>"}]` - the id MUST be a
//!   string, and items without a known TVDB id are omitted entirely.

use axum::extract::{Host, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::rss;
use crate::types::MediaType;

use super::{pending_requests, require_feed_token, ApiError, AppState, TokenQuery};

#[derive(Debug, Serialize)]
pub struct RadarrItem {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SonarrItem {
    #[serde(rename = "tvdbId")]
    pub tvdb_id: String,
}

/// GET /list/radarr - pending movies in StevenLu custom format.
pub async fn radarr_list(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<RadarrItem>>, ApiError> {
    require_feed_token(&state, query.token.as_deref())?;
    let items = pending_requests(&state, Some(MediaType::Movie))?
        .into_iter()
        .map(|request| RadarrItem {
            title: match request.year {
                Some(year) => format!("{} ({year})", request.title),
                None => request.title,
            },
            imdb_id: request.imdb_id,
            poster_url: request
                .poster_path
                .map(|path| format!("https://image.tmdb.org/t/p/w300{path}")),
        })
        .collect();
    Ok(Json(items))
}

/// GET /list/sonarr - pending TV with known TVDB ids.
pub async fn sonarr_list(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<SonarrItem>>, ApiError> {
    require_feed_token(&state, query.token.as_deref())?;
    let items = pending_requests(&state, Some(MediaType::Tv))?
        .into_iter()
        .filter_map(|request| request.tvdb_id)
        .map(|tvdb_id| SonarrItem {
            tvdb_id: tvdb_id.to_string(),
        })
        .collect();
    Ok(Json(items))
}

/// Public base URL for links inside feeds: configured BASE_URL, else the
/// Host header.
fn base_url(state: &AppState, host: &str) -> String {
    state
        .config
        .base_url
        .clone()
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{host}"))
}

fn rss_response(xml: String) -> Response {
    ([(header::CONTENT_TYPE, "application/rss+xml")], xml).into_response()
}

/// GET /rss/movies - Radarr-compatible RSS list.
pub async fn rss_movies(
    State(state): State<AppState>,
    Host(host): Host,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    require_feed_token(&state, query.token.as_deref())?;
    let requests = pending_requests(&state, Some(MediaType::Movie))?;
    let xml = rss::movie_feed(&requests, &base_url(&state, &host))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(rss_response(xml))
}

/// GET /rss/tv
pub async fn rss_tv(
    State(state): State<AppState>,
    Host(host): Host,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    require_feed_token(&state, query.token.as_deref())?;
    let requests = pending_requests(&state, Some(MediaType::Tv))?;
    let xml = rss::tv_feed(&requests, &base_url(&state, &host))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(rss_response(xml))
}

/// GET /rss/all
pub async fn rss_all(
    State(state): State<AppState>,
    Host(host): Host,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    require_feed_token(&state, query.token.as_deref())?;
    let requests = pending_requests(&state, None)?;
    let xml = rss::combined_feed(&requests, &base_url(&state, &host))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(rss_response(xml))
}

/// GET /api/feeds - feed directory for the frontend settings page.
pub async fn feed_info(State(state): State<AppState>, Host(host): Host) -> Json<Value> {
    let base = base_url(&state, &host);
    let token_required = state.config.feed_token.is_some();
    let token_param = if token_required {
        "?token=YOUR_FEED_TOKEN"
    } else {
        ""
    };
    Json(json!({
        "token_required": token_required,
        "feeds": {
            "radarr": {
                "name": "Radarr (Movies)",
                "url": format!("{base}/list/radarr{token_param}"),
                "format": "json",
                "setup": "Settings -> Import Lists -> Custom Lists -> StevenLu Custom",
            },
            "sonarr": {
                "name": "Sonarr (TV Shows)",
                "url": format!("{base}/list/sonarr{token_param}"),
                "format": "json",
                "setup": "Settings -> Import Lists -> Add -> Custom Lists",
            },
            "radarr_rss": {
                "name": "Radarr RSS (Movies)",
                "url": format!("{base}/rss/movies{token_param}"),
                "format": "rss",
            },
            "tv_rss": {
                "name": "TV Shows RSS",
                "url": format!("{base}/rss/tv{token_param}"),
                "format": "rss",
            },
            "all_rss": {
                "name": "All Media RSS",
                "url": format!("{base}/rss/all{token_param}"),
                "format": "rss",
            },
        },
    }))
}
