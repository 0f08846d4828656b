//! Domain records stored in the item store
//!
//! Four entity families share one keyspace:
//! - `MediaRequest` - partition `movie`/`tv`, sort tmdb_id
//! - `LibraryMember` - partition `LIB#<media_type>`, sort tmdb_id
//! - `GuidCacheEntry` - partition `GUIDCACHE`, sort plex guid
//! - `PushSubscription` - partition `PUSH`, sort user name
//!
//! Rate-limit buckets (`RATELIMIT#<ip>`) are manipulated attribute-wise by
//! the auth module and have no record struct here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{Item, Key, StorageError};

/// Partition for cached Plex GUID → show-level id mappings.
pub const GUID_CACHE_PARTITION: &str = "GUIDCACHE";
/// Partition for Web Push subscriptions.
pub const PUSH_PARTITION: &str = "PUSH";
/// Partition prefix for per-IP rate-limit buckets.
pub const RATE_LIMIT_PREFIX: &str = "RATELIMIT#";

/// Normalized media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Tv => "tv",
        }
    }

    /// Partition holding library membership for this kind.
    pub fn library_partition(self) -> String {
        format!("LIB#{}", self.as_str())
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(MediaType::Movie),
            "tv" => Ok(MediaType::Tv),
            _ => Err(()),
        }
    }
}

/// A user's media request.
///
/// Pending while `added_at` is null; fulfilled exactly once when the
/// reconciliation engine observes the item in the library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRequest {
    pub tmdb_id: i64,
    pub media_type: MediaType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvdb_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Fulfillment timestamp. Monotonic: once set, never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
    /// Cached show-level Plex GUID, learned from webhooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plex_guid: Option<String>,
}

impl MediaRequest {
    pub fn key(&self) -> Key {
        Self::key_for(self.media_type, self.tmdb_id)
    }

    pub fn key_for(media_type: MediaType, tmdb_id: i64) -> Key {
        Key::new(media_type.as_str(), tmdb_id)
    }

    pub fn is_pending(&self) -> bool {
        self.added_at.is_none()
    }
}

/// Library membership: "the media server has this item indexed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryMember {
    pub tmdb_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvdb_id: Option<i64>,
    pub title: String,
    pub synced_at: DateTime<Utc>,
}

impl LibraryMember {
    pub fn key_for(media_type: MediaType, tmdb_id: i64) -> Key {
        Key::new(media_type.library_partition(), tmdb_id)
    }
}

/// Cached show-level ids for a Plex GUID.
///
/// Written on every successful resolution; later episodes of the same show
/// short-circuit here instead of re-running the TVDB reverse lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidCacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_tmdb_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_tvdb_id: Option<i64>,
    pub cached_at: DateTime<Utc>,
}

impl GuidCacheEntry {
    pub fn key_for(plex_guid: &str) -> Key {
        Key::new(GUID_CACHE_PARTITION, plex_guid)
    }
}

/// Web Push subscription keys as handed over by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// One active push subscription per user name; overwritten on re-subscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

impl PushSubscription {
    pub fn key_for(user_name: &str) -> Key {
        Key::new(PUSH_PARTITION, user_name)
    }
}

/// Serialize a record into a storable attribute map.
pub fn to_item<T: Serialize>(record: &T) -> Result<Item, StorageError> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::Serialization(format!(
            "record serialized to non-object value: {other}"
        ))),
    }
}

/// Deserialize a stored attribute map back into a record.
pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T, StorageError> {
    serde_json::from_value(Value::Object(item)).map_err(StorageError::from)
}
