//! Web Push subscription management

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::notify::webpush;
use crate::types::{to_item, PushSubscription};

use super::{ApiError, AppState, Session};

/// The push endpoints key subscriptions by user name, so a legacy token
/// without one cannot manage subscriptions.
fn require_name(session: &crate::auth::SessionUser) -> Result<&str, ApiError> {
    session
        .name
        .as_deref()
        .ok_or_else(|| ApiError::BadInput("Session token carries no user name".to_string()))
}

/// POST /api/push/subscribe - store (or replace) the user's subscription.
pub async fn subscribe(
    State(state): State<AppState>,
    Session(session): Session,
    Json(subscription): Json<PushSubscription>,
) -> Result<Json<Value>, ApiError> {
    let name = require_name(&session)?;
    state.store.put(
        &PushSubscription::key_for(name),
        to_item(&subscription)?,
        None,
    )?;
    info!(name, "push subscription stored");
    Ok(Json(json!({ "success": true })))
}

/// DELETE /api/push/subscribe
pub async fn unsubscribe(
    State(state): State<AppState>,
    Session(session): Session,
) -> Result<Json<Value>, ApiError> {
    let name = require_name(&session)?;
    state.store.delete(&PushSubscription::key_for(name))?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/push/status
pub async fn status(
    State(state): State<AppState>,
    Session(session): Session,
) -> Result<Json<Value>, ApiError> {
    let subscribed = match session.name.as_deref() {
        Some(name) => state.store.get(&PushSubscription::key_for(name))?.is_some(),
        None => false,
    };
    Ok(Json(json!({ "subscribed": subscribed })))
}

/// GET /api/push/vapid-public-key - the `applicationServerKey` for the
/// frontend subscribe call.
pub async fn vapid_public_key(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if let Some(key) = &state.config.vapid_public_key {
        return Ok(Json(json!({ "key": key })));
    }
    // Derive from the private key when only that is configured.
    if let Some(private_key) = &state.config.vapid_private_key {
        if let Ok(key) = webpush::vapid_public_key(private_key) {
            return Ok(Json(json!({ "key": key })));
        }
    }
    Err(ApiError::NotFound("Push notifications not configured".to_string()))
}
