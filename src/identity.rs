//! Plex payload parsing and identity normalization
//!
//! Turns a Plex webhook payload (or one library-sync element) into a
//! `MediaIdentity`. Plex attaches external ids at the *item* level, so a
//! season or episode carries season/episode-scoped ids in its `Guid` array -
//! those must never be taken for show-level ids, or they would poison the
//! library cache. Show-level identification for seasons/episodes therefore
//! rests on the parent/grandparent Plex GUID alone.

use serde::{Deserialize, Serialize};

use crate::types::MediaType;

/// Plex's own item kind, as reported in `Metadata.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlexType {
    Movie,
    Show,
    Season,
    Episode,
}

/// Normalized identity extracted from a Plex payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaIdentity {
    pub media_type: MediaType,
    pub plex_type: PlexType,
    pub title: String,
    pub year: Option<i32>,
    /// Show-level TMDB id (movies and shows only; dropped for season/episode).
    pub tmdb_id: Option<i64>,
    /// Show-level TVDB id (movies and shows only).
    pub tvdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    /// Show-level Plex GUID (own guid for movie/show, parent/grandparent
    /// guid for season/episode).
    pub plex_guid: Option<String>,
    /// Episode-scoped TVDB id, kept for the reverse lookup.
    pub episode_tvdb_id: Option<i64>,
}

/// Plex webhook payload (the `payload` form field, JSON-decoded).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlexWebhook {
    #[serde(default)]
    pub event: String,
    #[serde(rename = "Server", default)]
    pub server: Option<PlexServer>,
    #[serde(rename = "Metadata", default)]
    pub metadata: Option<PlexMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlexServer {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlexMetadata {
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(rename = "parentTitle", default)]
    pub parent_title: Option<String>,
    #[serde(rename = "parentYear", default)]
    pub parent_year: Option<i32>,
    #[serde(rename = "parentGuid", default)]
    pub parent_guid: Option<String>,
    #[serde(rename = "grandparentTitle", default)]
    pub grandparent_title: Option<String>,
    #[serde(rename = "grandparentYear", default)]
    pub grandparent_year: Option<i32>,
    #[serde(rename = "grandparentGuid", default)]
    pub grandparent_guid: Option<String>,
    #[serde(rename = "Guid", default)]
    pub guids: Vec<PlexGuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlexGuid {
    #[serde(default)]
    pub id: String,
}

/// External ids pulled out of a `Guid` array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalIds {
    pub tmdb_id: Option<i64>,
    pub tvdb_id: Option<i64>,
    pub imdb_id: Option<String>,
}

/// Parse a `Guid` array of `{tmdb,tvdb,imdb}://<value>` strings.
pub fn parse_guid_list(guids: &[PlexGuid]) -> ExternalIds {
    let mut ids = ExternalIds::default();
    for guid in guids {
        if let Some(raw) = guid.id.strip_prefix("tmdb://") {
            ids.tmdb_id = raw.parse().ok().or(ids.tmdb_id);
        } else if let Some(raw) = guid.id.strip_prefix("tvdb://") {
            ids.tvdb_id = raw.parse().ok().or(ids.tvdb_id);
        } else if let Some(raw) = guid.id.strip_prefix("imdb://") {
            ids.imdb_id = Some(raw.to_string());
        }
    }
    ids
}

/// Normalize a Plex payload into a `MediaIdentity`.
///
/// Returns `None` for unsupported item types (music, photo, ...).
pub fn parse_plex_payload(payload: &PlexWebhook) -> Option<MediaIdentity> {
    let metadata = payload.metadata.as_ref()?;
    let mut ids = parse_guid_list(&metadata.guids);
    let mut episode_tvdb_id = None;

    let (plex_type, media_type, title, year, plex_guid) = match metadata.item_type.as_str() {
        "movie" => (
            PlexType::Movie,
            MediaType::Movie,
            metadata.title.clone(),
            metadata.year,
            metadata.guid.clone(),
        ),
        "show" => (
            PlexType::Show,
            MediaType::Tv,
            metadata.title.clone(),
            metadata.year,
            metadata.guid.clone(),
        ),
        "season" => (
            PlexType::Season,
            MediaType::Tv,
            metadata.parent_title.clone(),
            metadata.parent_year,
            metadata.parent_guid.clone(),
        ),
        "episode" => (
            PlexType::Episode,
            MediaType::Tv,
            metadata.grandparent_title.clone(),
            metadata.grandparent_year,
            metadata.grandparent_guid.clone(),
        ),
        _ => return None,
    };

    match plex_type {
        // The Guid array ids belong to the season, not the show.
        PlexType::Season => {
            ids.tmdb_id = None;
            ids.tvdb_id = None;
        }
        // The tvdb id identifies the episode; keep it for reverse lookup.
        // The tmdb id is episode-scoped too and unusable.
        PlexType::Episode => {
            episode_tvdb_id = ids.tvdb_id.take();
            ids.tmdb_id = None;
        }
        PlexType::Movie | PlexType::Show => {}
    }

    Some(MediaIdentity {
        media_type,
        plex_type,
        title: title.unwrap_or_else(|| "Unknown".to_string()),
        year,
        tmdb_id: ids.tmdb_id,
        tvdb_id: ids.tvdb_id,
        imdb_id: ids.imdb_id,
        plex_guid,
        episode_tvdb_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guids(ids: &[&str]) -> Vec<PlexGuid> {
        ids.iter().map(|id| PlexGuid { id: id.to_string() }).collect()
    }

    fn webhook(metadata: PlexMetadata) -> PlexWebhook {
        PlexWebhook {
            event: "library.new".into(),
            server: None,
            metadata: Some(metadata),
        }
    }

    #[test]
    fn movie_keeps_its_own_ids_and_guid() {
        let payload = webhook(PlexMetadata {
            item_type: "movie".into(),
            title: Some("The Matrix".into()),
            year: Some(1999),
            guid: Some("plex://movie/abc".into()),
            guids: guids(&["tmdb://603", "imdb://tt0133093"]),
            ..Default::default()
        });
        let identity = parse_plex_payload(&payload).unwrap();
        assert_eq!(identity.media_type, MediaType::Movie);
        assert_eq!(identity.plex_type, PlexType::Movie);
        assert_eq!(identity.tmdb_id, Some(603));
        assert_eq!(identity.imdb_id.as_deref(), Some("tt0133093"));
        assert_eq!(identity.plex_guid.as_deref(), Some("plex://movie/abc"));
        assert_eq!(identity.episode_tvdb_id, None);
    }

    #[test]
    fn show_maps_to_tv() {
        let payload = webhook(PlexMetadata {
            item_type: "show".into(),
            title: Some("Severance".into()),
            year: Some(2022),
            guid: Some("plex://show/xyz".into()),
            guids: guids(&["tmdb://95396", "tvdb://371980"]),
            ..Default::default()
        });
        let identity = parse_plex_payload(&payload).unwrap();
        assert_eq!(identity.media_type, MediaType::Tv);
        assert_eq!(identity.tmdb_id, Some(95396));
        assert_eq!(identity.tvdb_id, Some(371980));
    }

    #[test]
    fn season_drops_scoped_ids_and_uses_parent_guid() {
        let payload = webhook(PlexMetadata {
            item_type: "season".into(),
            parent_title: Some("Severance".into()),
            parent_year: Some(2022),
            parent_guid: Some("plex://show/xyz".into()),
            // season-scoped ids must not leak into show-level fields
            guids: guids(&["tmdb://140251", "tvdb://1955911"]),
            ..Default::default()
        });
        let identity = parse_plex_payload(&payload).unwrap();
        assert_eq!(identity.media_type, MediaType::Tv);
        assert_eq!(identity.title, "Severance");
        assert_eq!(identity.tmdb_id, None);
        assert_eq!(identity.tvdb_id, None);
        assert_eq!(identity.episode_tvdb_id, None);
        assert_eq!(identity.plex_guid.as_deref(), Some("plex://show/xyz"));
    }

    #[test]
    fn episode_moves_tvdb_id_to_episode_scope() {
        let payload = webhook(PlexMetadata {
            item_type: "episode".into(),
            grandparent_title: Some("Severance".into()),
            grandparent_year: Some(2022),
            grandparent_guid: Some("plex://show/xyz".into()),
            guids: guids(&["tmdb://4380821", "tvdb://999999"]),
            ..Default::default()
        });
        let identity = parse_plex_payload(&payload).unwrap();
        assert_eq!(identity.plex_type, PlexType::Episode);
        assert_eq!(identity.tmdb_id, None);
        assert_eq!(identity.tvdb_id, None);
        assert_eq!(identity.episode_tvdb_id, Some(999999));
        assert_eq!(identity.plex_guid.as_deref(), Some("plex://show/xyz"));
    }

    #[test]
    fn unsupported_types_yield_none() {
        for kind in ["track", "music", "photo", ""] {
            let payload = webhook(PlexMetadata {
                item_type: kind.into(),
                ..Default::default()
            });
            assert!(parse_plex_payload(&payload).is_none(), "type {kind:?}");
        }
        assert!(parse_plex_payload(&PlexWebhook::default()).is_none());
    }

    #[test]
    fn malformed_guid_entries_are_skipped() {
        let ids = parse_guid_list(&guids(&["tmdb://not-a-number", "tvdb://67890", "junk"]));
        assert_eq!(ids.tmdb_id, None);
        assert_eq!(ids.tvdb_id, Some(67890));
        assert_eq!(ids.imdb_id, None);
    }
}
