//! Metadata API adapter contracts, the HTTP client, and raw → record normalization.

pub mod api;
pub mod normalize;

pub use api::{
    ApiError, DataApiClient, DataApiConfig, ListResponse, MetadataApi, RawChannel,
    RawChannelSnippet, RawChannelStatistics, RawComment, RawCommentSnippet, RawCommentThread,
    RawCommentThreadSnippet, RawPlaylist, RawPlaylistContentDetails, RawPlaylistSnippet,
    RawResourceId, RawSearchResult, RawThumbnail, RawThumbnails, RawVideoSnippet,
    DEFAULT_API_BASE_URL, MAX_PAGE_SIZE,
};
pub use normalize::{
    normalize_channel, normalize_comment, normalize_playlist, normalize_video,
    parse_api_timestamp, MappingError,
};

pub const CRATE_NAME: &str = "tubestage-adapters";
