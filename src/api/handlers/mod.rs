//! Endpoint handlers, grouped by concern
//!
//! Shared plumbing lives here: the Bearer session extractor, client IP
//! resolution for rate limiting, and the feed/webhook token guards.

pub mod auth;
pub mod feeds;
pub mod health;
pub mod ingest;
pub mod media;
pub mod push;

use async_trait::async_trait;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Deserialize;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;

use crate::auth::SessionUser;
use crate::types::{from_item, MediaRequest, MediaType};

use super::{ApiError, AppState};

/// Authenticated session (extracted from a Bearer token).
pub struct Session(pub SessionUser);

#[async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Auth("Authorization header required".to_string()))?;
        let session = state
            .auth
            .session_from_token(token)
            .ok_or_else(|| ApiError::Auth("Invalid or expired token".to_string()))?;
        Ok(Session(session))
    }
}

/// `?token=` query parameter used by feeds, webhooks and sync.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenQuery {
    pub token: Option<String>,
}

fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Feed endpoints are open unless FEED_TOKEN is configured.
pub(crate) fn require_feed_token(state: &AppState, token: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = state.config.feed_token.as_deref() else {
        return Ok(());
    };
    match token {
        Some(provided) if token_matches(provided, expected) => Ok(()),
        Some(_) => Err(ApiError::Auth("Invalid feed token".to_string())),
        None => Err(ApiError::Auth(
            "Feed token required. Add ?token=YOUR_TOKEN to the URL.".to_string(),
        )),
    }
}

/// Webhook ingress requires a configured token; an unconfigured webhook
/// rejects everything.
pub(crate) fn require_webhook_token(
    state: &AppState,
    token: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected) = state.config.plex_webhook_token.as_deref() else {
        return Err(ApiError::Auth("Plex webhook not configured".to_string()));
    };
    match token {
        Some(provided) if token_matches(provided, expected) => Ok(()),
        Some(_) => Err(ApiError::Auth("Invalid webhook token".to_string())),
        None => Err(ApiError::Auth("Webhook token required".to_string())),
    }
}

/// Client address for rate limiting: forwarded headers first (the broker is
/// expected to sit behind a reverse proxy), then the peer address.
pub(crate) fn client_ip(headers: &HeaderMap, extensions: &axum::http::Extensions) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// All requests, newest first, optionally scoped to one media type.
pub(crate) fn all_requests(
    state: &AppState,
    media_type: Option<MediaType>,
) -> Result<Vec<MediaRequest>, ApiError> {
    let partitions: Vec<MediaType> = match media_type {
        Some(mt) => vec![mt],
        None => vec![MediaType::Movie, MediaType::Tv],
    };
    let mut requests = Vec::new();
    for mt in partitions {
        for item in state.store.query(mt.as_str(), None)? {
            requests.push(from_item::<MediaRequest>(item)?);
        }
    }
    requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(requests)
}

/// Pending requests only - the subset downstream pollers care about.
pub(crate) fn pending_requests(
    state: &AppState,
    media_type: Option<MediaType>,
) -> Result<Vec<MediaRequest>, ApiError> {
    let mut requests = all_requests(state, media_type)?;
    requests.retain(MediaRequest::is_pending);
    Ok(requests)
}

/// Parse a user-supplied media type, rejecting anything unknown.
pub(crate) fn parse_media_type(raw: &str) -> Result<MediaType, ApiError> {
    raw.parse()
        .map_err(|()| ApiError::BadInput("media_type must be 'movie' or 'tv'".to_string()))
}
