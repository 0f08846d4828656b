//! Search, trending and request lifecycle endpoints

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::storage::{Condition, StorageError};
use crate::types::{to_item, MediaRequest, MediaType};

use super::{all_requests, parse_media_type, pending_requests, ApiError, AppState, Session};

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
}

fn default_page() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct RequestBody {
    pub tmdb_id: i64,
    pub media_type: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TrendingQuery {
    #[serde(default = "default_trending_type")]
    pub media_type: String,
}

fn default_trending_type() -> String {
    "all".to_string()
}

fn is_requested(state: &AppState, media_type: MediaType, tmdb_id: i64) -> bool {
    state
        .store
        .get(&MediaRequest::key_for(media_type, tmdb_id))
        .ok()
        .flatten()
        .is_some()
}

fn is_in_library(state: &AppState, media_type: MediaType, tmdb_id: i64) -> bool {
    state
        .store
        .get(&crate::types::LibraryMember::key_for(media_type, tmdb_id))
        .ok()
        .flatten()
        .is_some()
}

/// Annotate raw TMDB results with request/library state and, for TV, season
/// counts fetched concurrently (best-effort).
async fn annotate_results(
    state: &AppState,
    results: &Value,
    fallback_type: Option<&str>,
) -> Vec<Value> {
    let empty = Vec::new();
    let raw_items = results
        .get("results")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    let mut items = Vec::new();
    let mut seasons_to_fetch = Vec::new();

    for raw in raw_items {
        let item_type = raw
            .get("media_type")
            .and_then(Value::as_str)
            .or(fallback_type)
            .unwrap_or("movie");
        if item_type == "person" {
            continue;
        }
        let Ok(media_type) = item_type.parse::<MediaType>() else {
            continue;
        };
        let Some(tmdb_id) = raw.get("id").and_then(Value::as_i64) else {
            continue;
        };

        let (title, date) = match media_type {
            MediaType::Tv => ("name", "first_air_date"),
            MediaType::Movie => ("title", "release_date"),
        };
        let title = raw.get(title).and_then(Value::as_str).unwrap_or("Unknown");
        let year: Option<i32> = raw
            .get(date)
            .and_then(Value::as_str)
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse().ok());

        let requested = is_requested(state, media_type, tmdb_id);
        let in_library = is_in_library(state, media_type, tmdb_id);

        items.push(json!({
            "id": tmdb_id,
            "title": title,
            "year": year,
            "overview": raw.get("overview"),
            "poster_path": raw.get("poster_path"),
            "media_type": media_type,
            "vote_average": raw.get("vote_average"),
            "requested": requested,
            "in_library": in_library,
            "number_of_seasons": Value::Null,
        }));

        if media_type == MediaType::Tv && !requested && !in_library {
            seasons_to_fetch.push((items.len() - 1, tmdb_id));
        }
    }

    // Concurrent season-count fan-out; failures silently leave null.
    let fetches = seasons_to_fetch.iter().map(|&(index, tmdb_id)| {
        let tmdb = state.tmdb.clone();
        async move {
            let seasons = tmdb
                .get_tv(tmdb_id)
                .await
                .ok()
                .and_then(|details| details.number_of_seasons);
            (index, seasons)
        }
    });
    for (index, seasons) in join_all(fetches).await {
        if let Some(seasons) = seasons {
            items[index]["number_of_seasons"] = json!(seasons);
        }
    }

    items
}

/// POST /api/search - proxy TMDB search with request/library annotations.
pub async fn search(
    State(state): State<AppState>,
    _session: Session,
    Json(body): Json<SearchBody>,
) -> Result<Json<Value>, ApiError> {
    let results = match body.media_type.as_deref() {
        Some("movie") => state.tmdb.search_movie(&body.query, body.page).await?,
        Some("tv") => state.tmdb.search_tv(&body.query, body.page).await?,
        _ => state.tmdb.search_multi(&body.query, body.page).await?,
    };
    let items = annotate_results(&state, &results, body.media_type.as_deref()).await;
    Ok(Json(json!({
        "results": items,
        "page": results.get("page").cloned().unwrap_or(json!(1)),
        "total_pages": results.get("total_pages").cloned().unwrap_or(json!(1)),
        "total_results": results.get("total_results").cloned().unwrap_or(json!(0)),
    })))
}

/// GET /api/trending - trending lists with the same annotations, cacheable
/// for an hour.
pub async fn trending(
    State(state): State<AppState>,
    _session: Session,
    Query(query): Query<TrendingQuery>,
) -> Result<Response, ApiError> {
    if !matches!(query.media_type.as_str(), "all" | "movie" | "tv") {
        return Err(ApiError::BadInput(
            "media_type must be 'all', 'movie' or 'tv'".to_string(),
        ));
    }
    let results = state.tmdb.get_trending(&query.media_type).await?;
    let fallback = match query.media_type.as_str() {
        "all" => None,
        other => Some(other),
    };
    let items = annotate_results(&state, &results, fallback).await;
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(json!({ "results": items })),
    )
        .into_response())
}

/// POST /api/request - fetch TMDB details and file the request.
pub async fn create_request(
    State(state): State<AppState>,
    Session(session): Session,
    Json(body): Json<RequestBody>,
) -> Result<Json<Value>, ApiError> {
    let media_type = parse_media_type(&body.media_type)?;
    let details = match media_type {
        MediaType::Movie => state.tmdb.get_movie(body.tmdb_id).await?,
        MediaType::Tv => state.tmdb.get_tv(body.tmdb_id).await?,
    };

    let external_ids = details.external_ids.clone().unwrap_or_default();
    let title = details.display_title();
    let request = MediaRequest {
        tmdb_id: body.tmdb_id,
        media_type,
        title: title.clone(),
        year: details.year(),
        overview: details.overview.clone(),
        poster_path: details.poster_path.clone(),
        imdb_id: external_ids.imdb_id,
        tvdb_id: match media_type {
            MediaType::Tv => external_ids.tvdb_id,
            MediaType::Movie => None,
        },
        requested_by: body.requested_by.or(session.name),
        created_at: Utc::now(),
        added_at: None,
        plex_guid: None,
    };

    match state
        .store
        .put(&request.key(), to_item(&request)?, Some(Condition::KeyNotExists))
    {
        Ok(()) => {
            info!(%media_type, tmdb_id = body.tmdb_id, %title, "request added");
            Ok(Json(json!({
                "success": true,
                "message": format!("Added {title} to requests"),
            })))
        }
        Err(StorageError::ConditionFailed) => Ok(Json(json!({
            "success": false,
            "message": "Item may already be requested",
        }))),
        Err(err) => Err(err.into()),
    }
}

/// DELETE /api/request/{media_type}/{tmdb_id}
pub async fn delete_request(
    State(state): State<AppState>,
    _session: Session,
    Path((media_type, tmdb_id)): Path<(String, i64)>,
) -> Result<Json<Value>, ApiError> {
    let media_type = parse_media_type(&media_type)?;
    let key = MediaRequest::key_for(media_type, tmdb_id);
    if state.store.get(&key)?.is_none() {
        return Err(ApiError::NotFound("Request not found".to_string()));
    }
    state.store.delete(&key)?;
    Ok(Json(json!({ "success": true, "message": "Request removed" })))
}

/// GET /api/requests - all requests, newest first.
pub async fn list_requests(
    State(state): State<AppState>,
    _session: Session,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let media_type = query
        .media_type
        .as_deref()
        .map(parse_media_type)
        .transpose()?;
    let requests = all_requests(&state, media_type)?;
    Ok(Json(json!({ "requests": requests })))
}

/// GET /api/library-status - library membership ids plus pending requests.
pub async fn library_status(
    State(state): State<AppState>,
    _session: Session,
) -> Result<Json<Value>, ApiError> {
    let mut library = serde_json::Map::new();
    for media_type in [MediaType::Movie, MediaType::Tv] {
        let mut ids: Vec<i64> = state
            .store
            .query(&media_type.library_partition(), None)?
            .iter()
            .filter_map(|item| item.get("tmdb_id").and_then(Value::as_i64))
            .collect();
        ids.sort_unstable();
        library.insert(media_type.to_string(), json!(ids));
    }
    let requests = pending_requests(&state, None)?;
    Ok(Json(json!({ "library": library, "requests": requests })))
}
