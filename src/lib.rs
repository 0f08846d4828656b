//! Requestarr: lightweight media request broker
//!
//! Mediates between end-users requesting movies and TV shows, a Plex media
//! server announcing newly indexed content, and Sonarr/Radarr pulling
//! curated request lists.
//!
//! ## Architecture
//!
//! - **Storage**: key-partitioned item store (sled) whose conditional
//!   update is the atomicity primitive everything else leans on
//! - **Identity**: Plex webhook payload normalization
//! - **Reconcile**: multi-strategy matcher that promotes pending requests
//!   to fulfilled exactly once when items land in the library
//! - **Notify**: Web Push (RFC 8188/8292) fulfillment notifications
//! - **Auth**: PBKDF2 challenge-response login with per-IP rate limiting
//! - **Api**: the axum HTTP surface

pub mod api;
pub mod auth;
pub mod config;
pub mod identity;
pub mod lookup;
pub mod notify;
pub mod reconcile;
pub mod rss;
pub mod storage;
pub mod tmdb;
pub mod types;

// Re-export the commonly wired pieces
pub use api::{create_app, AppState};
pub use config::AppConfig;
pub use reconcile::ReconcileEngine;
pub use storage::{ItemStore, SledStore, StorageError};
pub use types::{MediaRequest, MediaType};
