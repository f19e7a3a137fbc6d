//! Data API v3 wire types and the read-only client used by a fetch pass.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;
use tubestage_storage::{FetchError, HttpFetcher};

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Upper bound the API accepts for `maxResults`.
pub const MAX_PAGE_SIZE: u32 = 50;

/// Reasons that mean the credential itself is unusable for the rest of the run.
const FATAL_REASONS: [&str; 6] = [
    "keyInvalid",
    "keyExpired",
    "accessNotConfigured",
    "ipRefererBlocked",
    "quotaExceeded",
    "dailyLimitExceeded",
];

const QUOTA_REASONS: [&str; 2] = ["quotaExceeded", "dailyLimitExceeded"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawChannel {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub snippet: Option<RawChannelSnippet>,
    #[serde(default)]
    pub statistics: Option<RawChannelStatistics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawChannelSnippet {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChannelStatistics {
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    pub subscriber_count: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    pub video_count: Option<String>,
    #[serde(default)]
    pub hidden_subscriber_count: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSearchResult {
    #[serde(default)]
    pub id: Option<RawResourceId>,
    #[serde(default)]
    pub snippet: Option<RawVideoSnippet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResourceId {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub video_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVideoSnippet {
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnails: Option<RawThumbnails>,
    #[serde(default)]
    pub channel_title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawThumbnails {
    #[serde(default)]
    pub default: Option<RawThumbnail>,
    #[serde(default)]
    pub medium: Option<RawThumbnail>,
    #[serde(default)]
    pub high: Option<RawThumbnail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawThumbnail {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylist {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub snippet: Option<RawPlaylistSnippet>,
    #[serde(default)]
    pub content_details: Option<RawPlaylistContentDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylistSnippet {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub channel_title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylistContentDetails {
    #[serde(default)]
    pub item_count: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCommentThread {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub snippet: Option<RawCommentThreadSnippet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCommentThreadSnippet {
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub top_level_comment: Option<RawComment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawComment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub snippet: Option<RawCommentSnippet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCommentSnippet {
    #[serde(default)]
    pub author_display_name: Option<String>,
    #[serde(default)]
    pub text_display: Option<String>,
    #[serde(default)]
    pub text_original: Option<String>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// Statistics arrive as decimal strings; accept bare numbers too.
fn deserialize_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }

    Ok(
        Option::<StringOrNumber>::deserialize(deserializer)?.map(|value| match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

fn error_reason(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorEnvelope>(body)
        .ok()?
        .error
        .errors
        .into_iter()
        .find_map(|detail| detail.reason)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("could not reach the metadata api: {0}")]
    Connection(#[source] FetchError),
    #[error("metadata api `{endpoint}` answered {status} ({})", .reason.as_deref().unwrap_or("no reason"))]
    Status {
        endpoint: String,
        status: u16,
        reason: Option<String>,
    },
    #[error("decoding `{endpoint}` response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    fn from_fetch(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus {
                status,
                endpoint,
                body,
            } => ApiError::Status {
                endpoint,
                status,
                reason: error_reason(&body),
            },
            err => ApiError::Connection(err),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, ApiError::Connection(_))
    }

    /// Transport failures and credential/quota rejections; nothing later in
    /// the run can succeed after one of these.
    pub fn is_fatal(&self) -> bool {
        match self {
            ApiError::Connection(_) => true,
            ApiError::Status { status, reason, .. } => {
                *status == 401
                    || reason
                        .as_deref()
                        .is_some_and(|reason| FATAL_REASONS.contains(&reason))
            }
            ApiError::Decode { .. } => false,
        }
    }

    /// The daily quota is spent. Calls already answered stay valid.
    pub fn is_quota(&self) -> bool {
        self.reason()
            .is_some_and(|reason| QUOTA_REASONS.contains(&reason))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ApiError::Status { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }
}

/// Read-only access to the four resources a fetch pass needs.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// `None` when the API reports no channel for `channel_id`.
    async fn channel(&self, channel_id: &str) -> Result<Option<RawChannel>, ApiError>;

    async fn channel_videos(&self, channel_id: &str) -> Result<Vec<RawSearchResult>, ApiError>;

    async fn channel_playlists(&self, channel_id: &str) -> Result<Vec<RawPlaylist>, ApiError>;

    async fn comment_threads(&self, video_id: &str) -> Result<Vec<RawCommentThread>, ApiError>;
}

#[derive(Clone)]
pub struct DataApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_size: u32,
    pub max_pages: u32,
}

impl std::fmt::Debug for DataApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .finish()
    }
}

/// HTTP implementation of [`MetadataApi`] against the Data API v3.
#[derive(Debug)]
pub struct DataApiClient {
    http: HttpFetcher,
    config: DataApiConfig,
}

impl DataApiClient {
    pub fn new(http: HttpFetcher, mut config: DataApiConfig) -> Self {
        config.page_size = config.page_size.clamp(1, MAX_PAGE_SIZE);
        config.max_pages = config.max_pages.max(1);
        Self { http, config }
    }

    pub fn config(&self) -> &DataApiConfig {
        &self.config
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let mut query = params.to_vec();
        query.push(("key", self.config.api_key.clone()));
        let resp = self
            .http
            .get(&self.config.base_url, endpoint, &query)
            .await
            .map_err(ApiError::from_fetch)?;
        serde_json::from_slice(&resp.body).map_err(|source| ApiError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    /// Follows `nextPageToken` for at most `max_pages` pages.
    async fn list_paged<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        for page in 0..self.config.max_pages {
            let mut query = params.to_vec();
            query.push(("maxResults", self.config.page_size.to_string()));
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let resp: ListResponse<T> = self.get_json(endpoint, &query).await?;
            debug!(endpoint, page, items = resp.items.len(), "listed page");
            items.extend(resp.items);

            match resp.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl MetadataApi for DataApiClient {
    async fn channel(&self, channel_id: &str) -> Result<Option<RawChannel>, ApiError> {
        let resp: ListResponse<RawChannel> = self
            .get_json(
                "channels",
                &[
                    ("part", "snippet,statistics".to_string()),
                    ("id", channel_id.to_string()),
                ],
            )
            .await?;
        Ok(resp.items.into_iter().next())
    }

    async fn channel_videos(&self, channel_id: &str) -> Result<Vec<RawSearchResult>, ApiError> {
        self.list_paged(
            "search",
            &[
                ("part", "snippet".to_string()),
                ("channelId", channel_id.to_string()),
                ("type", "video".to_string()),
            ],
        )
        .await
    }

    async fn channel_playlists(&self, channel_id: &str) -> Result<Vec<RawPlaylist>, ApiError> {
        self.list_paged(
            "playlists",
            &[
                ("part", "snippet,contentDetails".to_string()),
                ("channelId", channel_id.to_string()),
            ],
        )
        .await
    }

    async fn comment_threads(&self, video_id: &str) -> Result<Vec<RawCommentThread>, ApiError> {
        self.list_paged(
            "commentThreads",
            &[
                ("part", "snippet".to_string()),
                ("videoId", video_id.to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;
    use tubestage_storage::{BackoffPolicy, HttpClientConfig};

    fn client(server: &MockServer, max_pages: u32) -> DataApiClient {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("tubestage-test".into()),
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        })
        .expect("http client");
        DataApiClient::new(
            http,
            DataApiConfig {
                base_url: server.base_url(),
                api_key: "test-key".into(),
                page_size: 5,
                max_pages,
            },
        )
    }

    #[tokio::test]
    async fn channel_lookup_returns_first_item() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/channels")
                .query_param("id", "UC1")
                .query_param("part", "snippet,statistics")
                .query_param("key", "test-key");
            then.status(200).json_body(json!({
                "items": [{
                    "id": "UC1",
                    "snippet": {"title": "First"},
                    "statistics": {"subscriberCount": "120", "videoCount": 7}
                }]
            }));
        });

        let channel = client(&server, 1).channel("UC1").await.unwrap().unwrap();
        assert_eq!(channel.id.as_deref(), Some("UC1"));
        let stats = channel.statistics.unwrap();
        assert_eq!(stats.subscriber_count.as_deref(), Some("120"));
        assert_eq!(stats.video_count.as_deref(), Some("7"));
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn channel_without_items_is_none() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/channels");
            then.status(200).json_body(json!({"kind": "youtube#channelListResponse"}));
        });

        assert!(client(&server, 1).channel("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn comments_disabled_is_a_non_fatal_status_error() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/commentThreads").query_param("videoId", "v1");
            then.status(403).json_body(json!({
                "error": {
                    "code": 403,
                    "message": "disabled comments",
                    "errors": [{"reason": "commentsDisabled"}]
                }
            }));
        });

        let err = client(&server, 1).comment_threads("v1").await.unwrap_err();
        assert_eq!(err.reason(), Some("commentsDisabled"));
        assert!(!err.is_fatal());
        assert!(!err.is_connection());
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn invalid_key_is_fatal() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/channels");
            then.status(400).json_body(json!({
                "error": {"code": 400, "errors": [{"reason": "keyInvalid"}]}
            }));
        });

        let err = client(&server, 1).channel("UC1").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.is_quota());
    }

    #[tokio::test]
    async fn exhausted_quota_is_fatal_and_flagged_as_quota() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/playlists");
            then.status(403).json_body(json!({
                "error": {"code": 403, "errors": [{"reason": "dailyLimitExceeded"}]}
            }));
        });

        let err = client(&server, 1).channel_playlists("UC1").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.is_quota());
        assert!(!err.is_connection());
    }

    #[tokio::test]
    async fn server_errors_are_retried_before_failing() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/playlists");
            then.status(503).body("unavailable");
        });

        let err = client(&server, 1).channel_playlists("UC1").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 503, .. }));
        mock.assert_calls(2);
    }

    #[tokio::test]
    async fn listing_follows_page_tokens_up_to_max_pages() {
        let server = MockServer::start_async().await;
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/search")
                .query_param("channelId", "UC1")
                .query_param("maxResults", "5")
                .query_param_missing("pageToken");
            then.status(200).json_body(json!({
                "nextPageToken": "p2",
                "items": [{"id": {"videoId": "v1"}, "snippet": {"title": "one"}}]
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET).path("/search").query_param("pageToken", "p2");
            then.status(200).json_body(json!({
                "nextPageToken": "p3",
                "items": [{"id": {"videoId": "v2"}, "snippet": {"title": "two"}}]
            }));
        });

        let videos = client(&server, 2).channel_videos("UC1").await.unwrap();
        let ids: Vec<_> = videos
            .iter()
            .filter_map(|v| v.id.as_ref().and_then(|id| id.video_id.as_deref()))
            .collect();
        assert_eq!(ids, ["v1", "v2"]);
        first.assert_calls(1);
        second.assert_calls(1);
    }

    #[test]
    fn config_debug_redacts_key() {
        let config = DataApiConfig {
            base_url: DEFAULT_API_BASE_URL.into(),
            api_key: "secret-key".into(),
            page_size: 10,
            max_pages: 1,
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-key"));
    }
}
