//! Core record model shared by the fetch, staging and migration stages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tubestage-core";

/// The four entity types moved through the pipeline.
///
/// Each kind carries its document collection name, relational table name,
/// natural-key column and the ordered list of data columns, so every stage can
/// be driven off this one table instead of per-entity code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Channel,
    Video,
    Playlist,
    Comment,
}

impl EntityKind {
    /// Migration order: parents before children.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Channel,
        EntityKind::Video,
        EntityKind::Playlist,
        EntityKind::Comment,
    ];

    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Channel => "channels",
            EntityKind::Video => "videos",
            EntityKind::Playlist => "playlists",
            EntityKind::Comment => "comments",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Channel => "channel_data",
            EntityKind::Video => "video_info",
            EntityKind::Playlist => "playlist_info",
            EntityKind::Comment => "comment_info",
        }
    }

    pub fn natural_key(self) -> &'static str {
        match self {
            EntityKind::Channel => "channel_id",
            EntityKind::Video => "video_id",
            EntityKind::Playlist => "playlist_id",
            EntityKind::Comment => "comment_id",
        }
    }

    /// Data columns in insert order; the natural key is always first.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            EntityKind::Channel => &["channel_id", "name", "subscriber_count", "video_count"],
            EntityKind::Video => &[
                "video_id",
                "title",
                "description",
                "thumbnail_url",
                "channel_title",
                "published_at",
                "channel_id",
            ],
            EntityKind::Playlist => &[
                "playlist_id",
                "title",
                "description",
                "channel_title",
                "item_count",
                "channel_id",
            ],
            EntityKind::Comment => &[
                "comment_id",
                "video_id",
                "author",
                "text",
                "like_count",
                "published_at",
                "channel_id",
            ],
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            EntityKind::Channel => "Channels",
            EntityKind::Video => "Videos",
            EntityKind::Playlist => "Playlists",
            EntityKind::Comment => "Comments",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity type `{0}` (expected channels, videos, playlists or comments)")]
pub struct UnknownEntity(pub String);

impl FromStr for EntityKind {
    type Err = UnknownEntity;

    /// Accepts collection names, table names and singular forms.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let needle = input.trim().to_ascii_lowercase();
        EntityKind::ALL
            .into_iter()
            .find(|kind| {
                needle == kind.collection()
                    || needle == kind.table()
                    || needle == kind.collection().trim_end_matches('s')
            })
            .ok_or_else(|| UnknownEntity(input.to_string()))
    }
}

/// A normalized, flat record that can be staged and migrated.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn natural_key(&self) -> &str;

    /// Owning channel, direct or transitive.
    fn channel_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub subscriber_count: i64,
    pub video_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub video_id: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    pub channel_title: String,
    pub published_at: DateTime<Utc>,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub playlist_id: String,
    pub title: String,
    pub description: String,
    pub channel_title: String,
    pub item_count: i64,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: String,
    pub video_id: String,
    pub author: String,
    pub text: String,
    pub like_count: i64,
    pub published_at: DateTime<Utc>,
    pub channel_id: String,
}

impl Record for Channel {
    const KIND: EntityKind = EntityKind::Channel;

    fn natural_key(&self) -> &str {
        &self.channel_id
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl Record for Video {
    const KIND: EntityKind = EntityKind::Video;

    fn natural_key(&self) -> &str {
        &self.video_id
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl Record for Playlist {
    const KIND: EntityKind = EntityKind::Playlist;

    fn natural_key(&self) -> &str {
        &self.playlist_id
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl Record for Comment {
    const KIND: EntityKind = EntityKind::Comment;

    fn natural_key(&self) -> &str {
        &self.comment_id
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

/// Four ordered record sequences, one per entity type, as produced by a fetch
/// pass or read back from staging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub channels: Vec<Channel>,
    pub videos: Vec<Video>,
    pub playlists: Vec<Playlist>,
    pub comments: Vec<Comment>,
}

impl RecordBatch {
    pub fn len_of(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Channel => self.channels.len(),
            EntityKind::Video => self.videos.len(),
            EntityKind::Playlist => self.playlists.len(),
            EntityKind::Comment => self.comments.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        EntityKind::ALL.into_iter().all(|kind| self.len_of(kind) == 0)
    }

    pub fn extend(&mut self, other: RecordBatch) {
        self.channels.extend(other.channels);
        self.videos.extend(other.videos);
        self.playlists.extend(other.playlists);
        self.comments.extend(other.comments);
    }

    /// Keep only records owned by one of `channel_ids`.
    pub fn retain_channels(&mut self, channel_ids: &[String]) {
        let owned = |id: &str| channel_ids.iter().any(|c| c == id);
        self.channels.retain(|r| owned(r.channel_id()));
        self.videos.retain(|r| owned(r.channel_id()));
        self.playlists.retain(|r| owned(r.channel_id()));
        self.comments.retain(|r| owned(r.channel_id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn entity_kind_parses_collection_table_and_singular_names() {
        assert_eq!("videos".parse::<EntityKind>().unwrap(), EntityKind::Video);
        assert_eq!("comment_info".parse::<EntityKind>().unwrap(), EntityKind::Comment);
        assert_eq!(" Playlist ".parse::<EntityKind>().unwrap(), EntityKind::Playlist);
        assert_eq!("channel_data".parse::<EntityKind>().unwrap(), EntityKind::Channel);
        assert!("subscriptions".parse::<EntityKind>().is_err());
    }

    #[test]
    fn natural_key_is_first_column() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.columns()[0], kind.natural_key());
        }
    }

    #[test]
    fn retain_channels_drops_other_owners() {
        let at = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).single().unwrap();
        let mut batch = RecordBatch {
            channels: vec![
                Channel {
                    channel_id: "UC1".into(),
                    name: "one".into(),
                    subscriber_count: 1,
                    video_count: 1,
                },
                Channel {
                    channel_id: "UC2".into(),
                    name: "two".into(),
                    subscriber_count: 2,
                    video_count: 2,
                },
            ],
            videos: vec![Video {
                video_id: "v1".into(),
                title: "t".into(),
                description: String::new(),
                thumbnail_url: String::new(),
                channel_title: "two".into(),
                published_at: at,
                channel_id: "UC2".into(),
            }],
            ..Default::default()
        };

        batch.retain_channels(&["UC1".to_string()]);
        assert_eq!(batch.channels.len(), 1);
        assert!(batch.videos.is_empty());
        assert!(!batch.is_empty());
    }

    #[test]
    fn records_serialize_timestamps_as_rfc3339() {
        let comment = Comment {
            comment_id: "c1".into(),
            video_id: "v1".into(),
            author: "a".into(),
            text: "hi".into(),
            like_count: 3,
            published_at: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).single().unwrap(),
            channel_id: "UC1".into(),
        };
        let value = serde_json::to_value(&comment).unwrap();
        assert_eq!(value["published_at"], "2023-06-01T12:00:00Z");
        let back: Comment = serde_json::from_value(value).unwrap();
        assert_eq!(back, comment);
    }
}
