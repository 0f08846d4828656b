//! HTTP surface
//!
//! Axum router over the shared application state:
//! - request lifecycle endpoints (search, request, list, delete)
//! - auth (challenge verification, session issuance)
//! - Plex ingress (webhook + bulk library sync)
//! - downstream JSON lists and RSS feeds for Radarr/Sonarr
//! - Web Push subscription management
//! - dependency-free health probe

pub mod handlers;
mod routes;

pub use routes::create_app;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::auth::AuthService;
use crate::config::AppConfig;
use crate::lookup::TvdbClient;
use crate::notify::{PushNotifier, VapidConfig};
use crate::reconcile::ReconcileEngine;
use crate::storage::{ItemStore, StorageError};
use crate::tmdb::{TmdbClient, TmdbError};

/// Shared application state. Cheap to clone; one instance per process.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ItemStore>,
    pub tmdb: Arc<TmdbClient>,
    pub engine: ReconcileEngine,
    pub auth: AuthService,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Wire all components from configuration and an opened store.
    pub fn new(store: Arc<dyn ItemStore>, config: AppConfig) -> Self {
        let tmdb = Arc::new(TmdbClient::new(config.tmdb_api_key.clone()));
        let tvdb = Arc::new(TvdbClient::new(config.tvdb_api_key.clone()));
        let vapid = match (&config.vapid_private_key, &config.vapid_public_key) {
            (Some(private_key), Some(public_key)) => Some(VapidConfig {
                private_key: private_key.clone(),
                public_key: public_key.clone(),
                subject: config.vapid_subject(),
            }),
            _ => None,
        };
        let notifier = Arc::new(PushNotifier::new(store.clone(), vapid));
        let engine = ReconcileEngine::new(
            store.clone(),
            tvdb,
            notifier,
            config.plex_server_name.clone(),
        );
        let auth = AuthService::new(
            config.app_secret_key.clone(),
            config.preshared_password.clone(),
            store.clone(),
            config.rate_limit.clone(),
        );
        Self {
            store,
            tmdb,
            engine,
            auth,
            config: Arc::new(config),
        }
    }
}

/// API error type for consistent error responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited { retry_after_seconds: i64 },
    #[error("{0}")]
    BadInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("storage error")]
    Storage(#[from] StorageError),
    #[error("upstream error")]
    Upstream(#[from] TmdbError),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Auth(message) => (StatusCode::UNAUTHORIZED, message.clone()),
            ApiError::RateLimited {
                retry_after_seconds,
            } => {
                let body = serde_json::json!({
                    "error": "Too many failed attempts, try again later",
                    "retry_after_seconds": retry_after_seconds,
                });
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("Retry-After", retry_after_seconds.to_string())],
                    Json(body),
                )
                    .into_response();
            }
            ApiError::BadInput(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message.clone()),
            // Internal detail stays in the logs, not in the response.
            ApiError::Storage(err) => {
                error!("storage error: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            ApiError::Upstream(err) => {
                error!("upstream error: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "upstream request failed".to_string())
            }
            ApiError::Internal(message) => {
                error!("internal error: {message}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
