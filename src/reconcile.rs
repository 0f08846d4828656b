//! Request-to-library reconciliation engine
//!
//! Two ingress paths share the engine: single Plex webhooks and bulk
//! library syncs. Both normalize to show-level identity, upsert library
//! membership, and promote matching pending requests to fulfilled through
//! one primitive: the storage conditional update `added_at := now IF
//! added_at IS NULL`. That condition is what makes fulfillment exactly-once
//! under replays and concurrent deliveries.
//!
//! Matching strategies are a declared table, evaluated in order; the first
//! one that fulfills a request wins. Every strategy also feeds the Plex
//! GUID cache so later episodes of the same show resolve without another
//! TVDB round trip.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::identity::{parse_plex_payload, MediaIdentity, PlexType, PlexWebhook};
use crate::lookup::EpisodeLookup;
use crate::notify::FulfillmentNotifier;
use crate::storage::{
    Condition, Item, ItemStore, Key, ReturnValues, StorageError, Update,
};
use crate::types::{
    from_item, to_item, GuidCacheEntry, LibraryMember, MediaRequest, MediaType,
};

/// Matching strategies, in evaluation order. First fulfillment wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Direct hit on the request key.
    TmdbId,
    /// Query the tv partition by show-level TVDB id.
    TvdbId,
    /// Scan requests for a previously learned Plex GUID.
    PlexGuid,
    /// Resolve the episode's TVDB id to its series via TVDB.
    EpisodeReverseLookup,
    /// Last resort: unique normalized title (+year ±1) match.
    TitleYear,
}

const STRATEGIES: [Strategy; 5] = [
    Strategy::TmdbId,
    Strategy::TvdbId,
    Strategy::PlexGuid,
    Strategy::EpisodeReverseLookup,
    Strategy::TitleYear,
];

/// Structured webhook result, returned verbatim to Plex.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookOutcome {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub library_updated: bool,
    pub matched_request: bool,
    pub notification_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<i64>,
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            status: "ignored",
            reason: Some(reason.into()),
            library_updated: false,
            matched_request: false,
            notification_sent: false,
            title: None,
            media_type: None,
            tmdb_id: None,
        }
    }
}

/// One element of a bulk library sync.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncItem {
    pub tmdb_id: i64,
    #[serde(default)]
    pub tvdb_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Bulk sync result.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub status: &'static str,
    pub synced: usize,
    pub marked_as_added: usize,
    pub media_type: MediaType,
}

/// Show-level ids after resolution (step 4 of webhook ingress).
#[derive(Debug, Clone, Copy, Default)]
struct ShowIds {
    tmdb: Option<i64>,
    tvdb: Option<i64>,
}

/// The reconciliation engine. Cheap to clone; all state lives in storage.
#[derive(Clone)]
pub struct ReconcileEngine {
    store: Arc<dyn ItemStore>,
    lookup: Arc<dyn EpisodeLookup>,
    notifier: Arc<dyn FulfillmentNotifier>,
    /// When set, webhooks from other servers are ignored.
    server_name: Option<String>,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn ItemStore>,
        lookup: Arc<dyn EpisodeLookup>,
        notifier: Arc<dyn FulfillmentNotifier>,
        server_name: Option<String>,
    ) -> Self {
        Self {
            store,
            lookup,
            notifier,
            server_name: server_name.filter(|s| !s.is_empty()),
        }
    }

    /// Webhook ingress: normalize, resolve show ids, record library
    /// membership, then try the strategy table.
    pub async fn handle_webhook(
        &self,
        payload: &PlexWebhook,
    ) -> Result<WebhookOutcome, StorageError> {
        if payload.event != "library.new" {
            return Ok(WebhookOutcome::ignored(format!(
                "Event type '{}' not processed",
                payload.event
            )));
        }
        if let Some(expected) = &self.server_name {
            let actual = payload.server.as_ref().map(|s| s.title.as_str()).unwrap_or("");
            if actual != expected.as_str() {
                return Ok(WebhookOutcome::ignored("Server name mismatch"));
            }
        }
        let Some(identity) = parse_plex_payload(payload) else {
            return Ok(WebhookOutcome::ignored("Unsupported media type"));
        };

        // Season/episode Guid-array ids are item-scoped; the only road to
        // show-level ids is the GUID cache.
        let show = match identity.plex_type {
            PlexType::Season | PlexType::Episode => match &identity.plex_guid {
                Some(guid) => self.cached_show_ids(guid)?,
                None => ShowIds::default(),
            },
            PlexType::Movie | PlexType::Show => ShowIds {
                tmdb: identity.tmdb_id,
                tvdb: identity.tvdb_id,
            },
        };

        let mut library_updated = false;
        if let Some(tmdb_id) = show.tmdb {
            self.upsert_library_member(identity.media_type, tmdb_id, show.tvdb, &identity.title)?;
            library_updated = true;
        }

        let mut fulfilled = None;
        for strategy in STRATEGIES {
            if !self.applies(strategy, &identity, show) {
                continue;
            }
            debug!(?strategy, title = %identity.title, "trying match strategy");
            if let Some(outcome) = self.run_strategy(strategy, &identity, show).await? {
                if outcome.library_inserted {
                    library_updated = true;
                }
                fulfilled = outcome.request;
                if fulfilled.is_some() {
                    info!(?strategy, title = %identity.title, "request fulfilled");
                    break;
                }
            }
        }

        let mut notification_sent = false;
        if let Some(request) = &fulfilled {
            notification_sent = self.notifier.notify_fulfilled(request).await;
        }

        Ok(WebhookOutcome {
            status: "success",
            reason: None,
            library_updated,
            matched_request: fulfilled.is_some(),
            notification_sent,
            title: Some(identity.title.clone()),
            media_type: Some(identity.media_type),
            tmdb_id: fulfilled.as_ref().map(|r| r.tmdb_id).or(show.tmdb),
        })
    }

    /// Bulk sync ingress: optional wholesale clear, upsert every member,
    /// then conditional fulfillment per item.
    pub async fn sync_library(
        &self,
        media_type: MediaType,
        items: &[SyncItem],
        clear: bool,
    ) -> Result<SyncOutcome, StorageError> {
        let partition = media_type.library_partition();
        if clear {
            for existing in self.store.query(&partition, None)? {
                if let Some(tmdb_id) = existing.get("tmdb_id").and_then(Value::as_i64) {
                    self.store.delete(&Key::new(partition.as_str(), tmdb_id))?;
                }
            }
        }

        let mut synced = 0;
        for item in items {
            self.upsert_library_member(
                media_type,
                item.tmdb_id,
                item.tvdb_id,
                item.title.as_deref().unwrap_or("Unknown"),
            )?;
            synced += 1;
        }

        let mut marked = 0;
        for item in items {
            if let Some(request) = self.fulfill(media_type, item.tmdb_id, None)? {
                self.notifier.notify_fulfilled(&request).await;
                marked += 1;
            }
        }

        info!(%media_type, synced, marked, clear, "library sync complete");
        Ok(SyncOutcome {
            status: "success",
            synced,
            marked_as_added: marked,
            media_type,
        })
    }

    // ========================================================================
    // Strategy table
    // ========================================================================

    fn applies(&self, strategy: Strategy, identity: &MediaIdentity, show: ShowIds) -> bool {
        match strategy {
            Strategy::TmdbId => show.tmdb.is_some(),
            Strategy::TvdbId => show.tvdb.is_some() && identity.media_type == MediaType::Tv,
            Strategy::PlexGuid => identity.plex_guid.is_some(),
            // Only when the GUID cache could not supply show-level ids; a
            // cache hit means the lookup already happened once.
            Strategy::EpisodeReverseLookup => {
                identity.episode_tvdb_id.is_some()
                    && show.tmdb.is_none()
                    && show.tvdb.is_none()
            }
            Strategy::TitleYear => {
                show.tmdb.is_none()
                    && show.tvdb.is_none()
                    && identity.plex_guid.is_none()
                    && identity.episode_tvdb_id.is_none()
            }
        }
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        identity: &MediaIdentity,
        show: ShowIds,
    ) -> Result<Option<StrategyOutcome>, StorageError> {
        let guid = identity.plex_guid.as_deref();
        match strategy {
            Strategy::TmdbId => {
                let tmdb_id = show.tmdb.unwrap_or_default();
                let request = self.fulfill(identity.media_type, tmdb_id, guid)?;
                if request.is_some() {
                    self.cache_guid(guid, show.tmdb, show.tvdb)?;
                }
                Ok(Some(StrategyOutcome::fulfillment(request)))
            }
            Strategy::TvdbId => {
                let tvdb_id = show.tvdb.unwrap_or_default();
                let Some(found) = self.find_request_by_tvdb(tvdb_id)? else {
                    return Ok(None);
                };
                let request = self.fulfill(MediaType::Tv, found.tmdb_id, guid)?;
                if request.is_some() {
                    self.cache_guid(guid, Some(found.tmdb_id), show.tvdb)?;
                }
                Ok(Some(StrategyOutcome::fulfillment(request)))
            }
            Strategy::PlexGuid => {
                let Some(found) = self.find_request_by_guid(guid.unwrap_or_default())? else {
                    return Ok(None);
                };
                let request = self.fulfill(found.media_type, found.tmdb_id, guid)?;
                if request.is_some() {
                    self.cache_guid(guid, Some(found.tmdb_id), found.tvdb_id)?;
                }
                Ok(Some(StrategyOutcome::fulfillment(request)))
            }
            Strategy::EpisodeReverseLookup => {
                let episode_id = identity.episode_tvdb_id.unwrap_or_default();
                let Some(series_tvdb) = self.lookup.series_id_from_episode(episode_id).await
                else {
                    return Ok(None);
                };
                let found = self.find_request_by_tvdb(series_tvdb)?;
                // Cache whatever was learned, matched request or not, so the
                // next episode of this show skips the TVDB call.
                self.cache_guid(guid, found.as_ref().map(|r| r.tmdb_id), Some(series_tvdb))?;
                let Some(found) = found else { return Ok(None) };
                let request = self.fulfill(MediaType::Tv, found.tmdb_id, guid)?;
                Ok(Some(StrategyOutcome::fulfillment(request)))
            }
            Strategy::TitleYear => {
                let Some(found) =
                    self.find_request_by_title(identity.media_type, &identity.title, identity.year)?
                else {
                    return Ok(None);
                };
                let request = self.fulfill(identity.media_type, found.tmdb_id, guid)?;
                if request.is_some() {
                    self.upsert_library_member(
                        identity.media_type,
                        found.tmdb_id,
                        found.tvdb_id,
                        &found.title,
                    )?;
                    self.cache_guid(guid, Some(found.tmdb_id), found.tvdb_id)?;
                    return Ok(Some(StrategyOutcome {
                        request,
                        library_inserted: true,
                    }));
                }
                Ok(Some(StrategyOutcome::fulfillment(request)))
            }
        }
    }

    // ========================================================================
    // Storage primitives
    // ========================================================================

    /// The exactly-once transition: `added_at := now IF added_at IS NULL`.
    ///
    /// Returns the fulfilled request post-image, or `None` when there was no
    /// pending request under this key (missing or already fulfilled).
    fn fulfill(
        &self,
        media_type: MediaType,
        tmdb_id: i64,
        plex_guid: Option<&str>,
    ) -> Result<Option<MediaRequest>, StorageError> {
        let key = MediaRequest::key_for(media_type, tmdb_id);
        let mut update = Update::new()
            .set("added_at", serde_json::to_value(Utc::now())?)
            .when(Condition::KeyExists)
            .when(Condition::FieldAbsent("added_at"));
        if let Some(guid) = plex_guid {
            update = update.set("plex_guid", guid);
        }
        match self.store.update(&key, update, ReturnValues::AllNew) {
            Ok(Some(item)) => Ok(Some(from_item(item)?)),
            Ok(None) => Ok(None),
            Err(StorageError::ConditionFailed) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn upsert_library_member(
        &self,
        media_type: MediaType,
        tmdb_id: i64,
        tvdb_id: Option<i64>,
        title: &str,
    ) -> Result<(), StorageError> {
        let member = LibraryMember {
            tmdb_id,
            tvdb_id,
            title: title.to_string(),
            synced_at: Utc::now(),
        };
        self.store
            .put(&LibraryMember::key_for(media_type, tmdb_id), to_item(&member)?, None)
    }

    fn cached_show_ids(&self, plex_guid: &str) -> Result<ShowIds, StorageError> {
        match self.store.get(&GuidCacheEntry::key_for(plex_guid))? {
            Some(item) => {
                let entry: GuidCacheEntry = from_item(item)?;
                debug!(plex_guid, "GUID cache hit");
                Ok(ShowIds {
                    tmdb: entry.show_tmdb_id,
                    tvdb: entry.show_tvdb_id,
                })
            }
            None => {
                debug!(plex_guid, "GUID cache miss");
                Ok(ShowIds::default())
            }
        }
    }

    /// Last-writer-wins cache write; a no-op without a GUID.
    fn cache_guid(
        &self,
        plex_guid: Option<&str>,
        show_tmdb_id: Option<i64>,
        show_tvdb_id: Option<i64>,
    ) -> Result<(), StorageError> {
        let Some(guid) = plex_guid else { return Ok(()) };
        if show_tmdb_id.is_none() && show_tvdb_id.is_none() {
            return Ok(());
        }
        let entry = GuidCacheEntry {
            show_tmdb_id,
            show_tvdb_id,
            cached_at: Utc::now(),
        };
        self.store
            .put(&GuidCacheEntry::key_for(guid), to_item(&entry)?, None)
    }

    // ========================================================================
    // Request lookups
    // ========================================================================

    fn find_request_by_tvdb(&self, tvdb_id: i64) -> Result<Option<MediaRequest>, StorageError> {
        let hits = self.store.query(
            MediaType::Tv.as_str(),
            Some(&|item: &Item| item.get("tvdb_id").and_then(Value::as_i64) == Some(tvdb_id)),
        )?;
        hits.into_iter().next().map(from_item).transpose()
    }

    fn find_request_by_guid(&self, plex_guid: &str) -> Result<Option<MediaRequest>, StorageError> {
        let hits = self.store.scan(Some(&|item: &Item| {
            item.get("plex_guid").and_then(Value::as_str) == Some(plex_guid)
                && item.contains_key("media_type")
        }))?;
        hits.into_iter().next().map(from_item).transpose()
    }

    /// Unique normalized title match within a media type. Ambiguity yields
    /// no match rather than a guess.
    fn find_request_by_title(
        &self,
        media_type: MediaType,
        title: &str,
        year: Option<i32>,
    ) -> Result<Option<MediaRequest>, StorageError> {
        let wanted = normalize_title(title);
        if wanted.is_empty() {
            return Ok(None);
        }
        let mut candidates = Vec::new();
        for item in self.store.query(media_type.as_str(), None)? {
            let request: MediaRequest = from_item(item)?;
            if !request.is_pending() {
                continue;
            }
            if normalize_title(&request.title) != wanted {
                continue;
            }
            if let Some(wanted_year) = year {
                let year_matches = request
                    .year
                    .map(|candidate_year| (candidate_year - wanted_year).abs() <= 1)
                    .unwrap_or(false);
                if !year_matches {
                    continue;
                }
            }
            candidates.push(request);
        }
        match candidates.len() {
            1 => Ok(candidates.pop()),
            0 => Ok(None),
            n => {
                warn!(title, n, "ambiguous title match, refusing to guess");
                Ok(None)
            }
        }
    }
}

struct StrategyOutcome {
    request: Option<MediaRequest>,
    library_inserted: bool,
}

impl StrategyOutcome {
    fn fulfillment(request: Option<MediaRequest>) -> Self {
        Self {
            request,
            library_inserted: false,
        }
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
