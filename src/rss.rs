//! RSS 2.0 feed rendering for downstream import lists
//!
//! Radarr can consume an RSS list directly; the feeds carry the pending
//! requests only, mirroring the JSON list endpoints. Items are identified
//! by IMDB id (movies) or TVDB id (tv) when known, falling back to the
//! display title.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::types::{MediaRequest, MediaType};

#[derive(Debug, thiserror::Error)]
#[error("feed rendering failed: {0}")]
pub struct RssError(#[from] quick_xml::Error);

/// `"Title (year)"` or bare title when the year is unknown.
fn display_title(request: &MediaRequest) -> String {
    match request.year {
        Some(year) => format!("{} ({year})", request.title),
        None => request.title.clone(),
    }
}

fn item_guid(request: &MediaRequest) -> String {
    match request.media_type {
        MediaType::Movie => request
            .imdb_id
            .clone()
            .unwrap_or_else(|| display_title(request)),
        MediaType::Tv => request
            .tvdb_id
            .map(|id| format!("tvdb-{id}"))
            .unwrap_or_else(|| display_title(request)),
    }
}

fn write_text(
    writer: &mut Writer<Vec<u8>>,
    tag: &str,
    text: &str,
) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn write_item(
    writer: &mut Writer<Vec<u8>>,
    request: &MediaRequest,
    label: Option<&str>,
) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new("item")))?;
    let title = match label {
        Some(label) => format!("[{label}] {}", display_title(request)),
        None => display_title(request),
    };
    write_text(writer, "title", &title)?;

    let mut guid = BytesStart::new("guid");
    guid.push_attribute(("isPermaLink", "false"));
    writer.write_event(Event::Start(guid))?;
    writer.write_event(Event::Text(BytesText::new(&item_guid(request))))?;
    writer.write_event(Event::End(BytesEnd::new("guid")))?;

    write_text(
        writer,
        "description",
        request
            .overview
            .as_deref()
            .unwrap_or("No description available"),
    )?;
    write_text(
        writer,
        "link",
        &format!(
            "https://www.themoviedb.org/{}/{}",
            request.media_type, request.tmdb_id
        ),
    )?;
    write_text(writer, "pubDate", &request.created_at.to_rfc2822())?;
    writer.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

fn render_feed(
    title: &str,
    description: &str,
    link: &str,
    requests: &[MediaRequest],
    labelled: bool,
) -> Result<String, RssError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(rss))?;
    writer.write_event(Event::Start(BytesStart::new("channel")))?;
    write_text(&mut writer, "title", title)?;
    write_text(&mut writer, "description", description)?;
    write_text(&mut writer, "link", link)?;
    write_text(&mut writer, "language", "en")?;

    for request in requests {
        let label = labelled.then(|| match request.media_type {
            MediaType::Movie => "Movie",
            MediaType::Tv => "TV",
        });
        write_item(&mut writer, request, label)?;
    }

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    writer.write_event(Event::End(BytesEnd::new("rss")))?;
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

/// Movie requests feed (Radarr compatible).
pub fn movie_feed(requests: &[MediaRequest], base_url: &str) -> Result<String, RssError> {
    render_feed(
        "Requestarr - Movie Requests",
        "Pending movie requests for Radarr",
        &format!("{base_url}/rss/movies"),
        requests,
        false,
    )
}

/// TV requests feed.
pub fn tv_feed(requests: &[MediaRequest], base_url: &str) -> Result<String, RssError> {
    render_feed(
        "Requestarr - TV Requests",
        "Pending TV show requests",
        &format!("{base_url}/rss/tv"),
        requests,
        false,
    )
}

/// Combined feed across both media types.
pub fn combined_feed(requests: &[MediaRequest], base_url: &str) -> Result<String, RssError> {
    render_feed(
        "Requestarr - All Requests",
        "All pending media requests",
        &format!("{base_url}/rss/all"),
        requests,
        true,
    )
}
