//! Liveness probe

use axum::Json;
use serde_json::{json, Value};

/// GET /api/health - dependency-free liveness check.
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "requestarr" }))
}
