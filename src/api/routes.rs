//! Route definitions
//!
//! - /api/auth/* - challenge-response login, session params
//! - /api/* - authenticated request lifecycle and push management
//! - /list/*, /rss/* - feed-token guarded downstream lists
//! - /webhook/plex, /sync/library - webhook-token guarded ingress
//! - /api/health - liveness

use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Create the complete application router.
pub fn create_app(state: AppState) -> Router {
    let cors = match state
        .config
        .allowed_origin
        .as_deref()
        .and_then(|origin| origin.parse::<HeaderValue>().ok())
    {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::permissive(),
    };

    Router::new()
        // Auth
        .route("/api/auth/params", get(handlers::auth::params))
        .route("/api/auth/verify", post(handlers::auth::verify))
        .route("/api/auth/logout", post(handlers::auth::logout))
        // Request lifecycle
        .route("/api/search", post(handlers::media::search))
        .route("/api/request", post(handlers::media::create_request))
        .route(
            "/api/request/:media_type/:tmdb_id",
            delete(handlers::media::delete_request),
        )
        .route("/api/requests", get(handlers::media::list_requests))
        .route("/api/library-status", get(handlers::media::library_status))
        .route("/api/trending", get(handlers::media::trending))
        // Web Push subscriptions
        .route(
            "/api/push/subscribe",
            post(handlers::push::subscribe).delete(handlers::push::unsubscribe),
        )
        .route("/api/push/status", get(handlers::push::status))
        .route(
            "/api/push/vapid-public-key",
            get(handlers::push::vapid_public_key),
        )
        // Downstream lists and feeds
        .route("/list/radarr", get(handlers::feeds::radarr_list))
        .route("/list/sonarr", get(handlers::feeds::sonarr_list))
        .route("/rss/movies", get(handlers::feeds::rss_movies))
        .route("/rss/tv", get(handlers::feeds::rss_tv))
        .route("/rss/all", get(handlers::feeds::rss_all))
        .route("/api/feeds", get(handlers::feeds::feed_info))
        // Plex ingress
        .route("/webhook/plex", post(handlers::ingest::plex_webhook))
        .route("/sync/library", post(handlers::ingest::sync_library))
        // Health
        .route("/api/health", get(handlers::health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
