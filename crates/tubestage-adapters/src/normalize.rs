//! Pure mapping from raw API items to flat records. No I/O.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tubestage_core::{Channel, Comment, EntityKind, Playlist, Video};

use crate::api::{RawChannel, RawCommentThread, RawPlaylist, RawSearchResult, RawThumbnails};

/// Fixed textual timestamp format the Data API uses.
const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("{entity} record is missing `{field}`")]
    MissingField {
        entity: EntityKind,
        field: &'static str,
    },
    #[error("`{field}` is not a valid timestamp: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("`{field}` is not a valid count: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("requested channel {requested} but the api returned {returned}")]
    KeyMismatch { requested: String, returned: String },
}

fn required(
    entity: EntityKind,
    field: &'static str,
    value: Option<&str>,
) -> Result<String, MappingError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(MappingError::MissingField { entity, field }),
    }
}

fn optional(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn parse_count(field: &'static str, value: Option<&str>) -> Result<i64, MappingError> {
    match value.map(str::trim) {
        None | Some("") => Ok(0),
        Some(v) => v.parse().map_err(|_| MappingError::InvalidNumber {
            field,
            value: v.to_string(),
        }),
    }
}

/// Parses the API's `YYYY-MM-DDTHH:MM:SSZ` format; RFC 3339 with fractional
/// seconds or an offset is accepted as well.
pub fn parse_api_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, MappingError> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, API_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|_| MappingError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

fn required_timestamp(
    entity: EntityKind,
    field: &'static str,
    value: Option<&str>,
) -> Result<DateTime<Utc>, MappingError> {
    let raw = required(entity, field, value)?;
    parse_api_timestamp(field, &raw)
}

fn best_thumbnail(thumbnails: Option<&RawThumbnails>) -> String {
    thumbnails
        .and_then(|t| {
            [&t.default, &t.medium, &t.high]
                .into_iter()
                .flatten()
                .find_map(|thumb| thumb.url.clone())
        })
        .unwrap_or_default()
}

/// The record key is the id the caller asked for; a response for any other
/// channel is rejected rather than silently re-keyed.
pub fn normalize_channel(requested_id: &str, raw: &RawChannel) -> Result<Channel, MappingError> {
    let kind = EntityKind::Channel;
    let returned = required(kind, "id", raw.id.as_deref())?;
    if returned != requested_id.trim() {
        return Err(MappingError::KeyMismatch {
            requested: requested_id.to_string(),
            returned,
        });
    }
    let snippet = raw.snippet.as_ref();
    let name = required(kind, "snippet.title", snippet.and_then(|s| s.title.as_deref()))?;
    let stats = raw.statistics.as_ref();

    Ok(Channel {
        channel_id: returned,
        name,
        subscriber_count: parse_count(
            "statistics.subscriberCount",
            stats.and_then(|s| s.subscriber_count.as_deref()),
        )?,
        video_count: parse_count(
            "statistics.videoCount",
            stats.and_then(|s| s.video_count.as_deref()),
        )?,
    })
}

pub fn normalize_video(channel_id: &str, raw: &RawSearchResult) -> Result<Video, MappingError> {
    let kind = EntityKind::Video;
    let video_id = required(
        kind,
        "id.videoId",
        raw.id.as_ref().and_then(|id| id.video_id.as_deref()),
    )?;
    let snippet = raw
        .snippet
        .as_ref()
        .ok_or(MappingError::MissingField { entity: kind, field: "snippet" })?;

    Ok(Video {
        video_id,
        title: required(kind, "snippet.title", snippet.title.as_deref())?,
        description: optional(snippet.description.as_deref()),
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        channel_title: optional(snippet.channel_title.as_deref()),
        published_at: required_timestamp(kind, "snippet.publishedAt", snippet.published_at.as_deref())?,
        channel_id: channel_id.to_string(),
    })
}

pub fn normalize_playlist(channel_id: &str, raw: &RawPlaylist) -> Result<Playlist, MappingError> {
    let kind = EntityKind::Playlist;
    let playlist_id = required(kind, "id", raw.id.as_deref())?;
    let snippet = raw.snippet.as_ref();

    Ok(Playlist {
        playlist_id,
        title: required(kind, "snippet.title", snippet.and_then(|s| s.title.as_deref()))?,
        description: optional(snippet.and_then(|s| s.description.as_deref())),
        channel_title: optional(snippet.and_then(|s| s.channel_title.as_deref())),
        item_count: raw
            .content_details
            .as_ref()
            .and_then(|d| d.item_count)
            .unwrap_or(0),
        channel_id: channel_id.to_string(),
    })
}

/// Maps the top-level comment of a thread; the thread id is the record key.
pub fn normalize_comment(
    channel_id: &str,
    video_id: &str,
    raw: &RawCommentThread,
) -> Result<Comment, MappingError> {
    let kind = EntityKind::Comment;
    let comment_id = required(kind, "id", raw.id.as_deref())?;
    let snippet = raw
        .snippet
        .as_ref()
        .and_then(|s| s.top_level_comment.as_ref())
        .and_then(|c| c.snippet.as_ref())
        .ok_or(MappingError::MissingField {
            entity: kind,
            field: "snippet.topLevelComment.snippet",
        })?;

    Ok(Comment {
        comment_id,
        video_id: video_id.to_string(),
        author: optional(snippet.author_display_name.as_deref()),
        text: optional(
            snippet
                .text_display
                .as_deref()
                .or(snippet.text_original.as_deref()),
        ),
        like_count: snippet.like_count.unwrap_or(0),
        published_at: required_timestamp(kind, "publishedAt", snippet.published_at.as_deref())?,
        channel_id: channel_id.to_string(),
    })
}
