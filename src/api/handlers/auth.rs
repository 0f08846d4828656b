//! Authentication endpoints

use axum::extract::State;
use axum::http::request::Parts;
use axum::Json;
use serde_json::{json, Value};

use crate::auth::{AuthChallenge, VerifyOutcome, PBKDF2_ITERATIONS};

use super::{client_ip, ApiError, AppState};

/// GET /api/auth/params - parameters the client needs to build a challenge.
pub async fn params() -> Json<Value> {
    Json(json!({ "iterations": PBKDF2_ITERATIONS }))
}

/// POST /api/auth/verify - challenge-response login.
///
/// The rate-limit check runs before anything expensive; a throttled caller
/// gets a 429 without costing a PBKDF2 derivation.
pub async fn verify(
    State(state): State<AppState>,
    parts: Parts,
    Json(challenge): Json<AuthChallenge>,
) -> Result<Json<Value>, ApiError> {
    let ip = client_ip(&parts.headers, &parts.extensions);
    match state.auth.verify(&challenge, &ip)? {
        VerifyOutcome::Granted { token, name } => Ok(Json(json!({
            "valid": true,
            "token": token,
            "name": name,
        }))),
        VerifyOutcome::Denied => Err(ApiError::Auth("Invalid credentials".to_string())),
        VerifyOutcome::RateLimited {
            retry_after_seconds,
        } => Err(ApiError::RateLimited {
            retry_after_seconds,
        }),
    }
}

/// POST /api/auth/logout - tokens are stateless; the client just drops its
/// copy.
pub async fn logout() -> Json<Value> {
    Json(json!({ "success": true }))
}
