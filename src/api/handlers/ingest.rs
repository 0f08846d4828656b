//! Plex ingress: webhook receiver and bulk library sync
//!
//! Both endpoints are guarded by the webhook token. Webhooks always answer
//! 200 once the payload parses - `{"status": "ignored"}` is a success, not
//! a failure, so Plex does not retry unsupported events forever.

use axum::extract::{Multipart, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::identity::PlexWebhook;
use crate::reconcile::{SyncItem, SyncOutcome, WebhookOutcome};

use super::{parse_media_type, require_webhook_token, ApiError, AppState, TokenQuery};

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub media_type: String,
    #[serde(default)]
    pub clear: bool,
    #[serde(default)]
    pub token: Option<String>,
}

/// POST /webhook/plex - multipart form with a `payload` JSON field.
pub async fn plex_webhook(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    mut multipart: Multipart,
) -> Result<Json<WebhookOutcome>, ApiError> {
    require_webhook_token(&state, query.token.as_deref())?;

    let mut payload: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadInput(format!("Invalid multipart body: {e}")))?
    {
        if field.name() == Some("payload") {
            payload = Some(
                field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadInput(format!("Invalid payload field: {e}")))?,
            );
        }
    }
    let payload =
        payload.ok_or_else(|| ApiError::BadInput("Missing payload field".to_string()))?;

    let webhook: PlexWebhook = serde_json::from_str(&payload)
        .map_err(|e| ApiError::BadInput(format!("Invalid JSON payload: {e}")))?;
    debug!(event = %webhook.event, "plex webhook received");

    let outcome = state.engine.handle_webhook(&webhook).await?;
    Ok(Json(outcome))
}

/// POST /sync/library?media_type=&clear= - JSON array of library items.
pub async fn sync_library(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
    body: String,
) -> Result<Json<SyncOutcome>, ApiError> {
    require_webhook_token(&state, query.token.as_deref())?;
    let media_type = parse_media_type(&query.media_type)?;

    let parsed: Value = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadInput(format!("Invalid JSON body: {e}")))?;
    if !parsed.is_array() {
        return Err(ApiError::BadInput("Body must be a JSON array".to_string()));
    }
    let items: Vec<SyncItem> = serde_json::from_value(parsed)
        .map_err(|e| ApiError::BadInput(format!("Invalid library items: {e}")))?;

    let outcome = state
        .engine
        .sync_library(media_type, &items, query.clear)
        .await?;
    Ok(Json(outcome))
}
