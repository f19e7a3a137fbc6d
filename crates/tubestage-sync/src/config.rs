//! Runtime configuration and the optional channel registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tubestage_adapters::{DataApiConfig, DEFAULT_API_BASE_URL, MAX_PAGE_SIZE};
use tubestage_storage::HttpClientConfig;

pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Everything a pipeline component needs, passed in at construction time.
#[derive(Clone)]
pub struct SyncConfig {
    pub api_credential: String,
    pub api_base_url: String,
    pub document_store_uri: String,
    pub relational_store_uri: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub workspace_root: PathBuf,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_credential", &if self.api_credential.is_empty() { "<unset>" } else { "<redacted>" })
            .field("api_base_url", &self.api_base_url)
            .field("document_store_uri", &self.document_store_uri)
            .field("relational_store_uri", &self.relational_store_uri)
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key → value source; unset or unparsable
    /// values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_credential: non_empty("YOUTUBE_API_KEY").unwrap_or_default(),
            api_base_url: non_empty("TUBESTAGE_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            document_store_uri: non_empty("DOCUMENT_STORE_URI")
                .unwrap_or_else(|| "file://./staging".to_string()),
            relational_store_uri: non_empty("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://tubestage.db".to_string()),
            page_size: non_empty("TUBESTAGE_PAGE_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
            max_pages: non_empty("TUBESTAGE_MAX_PAGES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(1u32)
                .max(1),
            http_timeout_secs: non_empty("TUBESTAGE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            user_agent: non_empty("TUBESTAGE_USER_AGENT")
                .unwrap_or_else(|| "tubestage/0.1".to_string()),
            workspace_root: PathBuf::from("."),
        }
    }

    /// Applies command-line overrides with the same bounds as the env values.
    pub fn with_paging(mut self, page_size: Option<u32>, max_pages: Option<u32>) -> Self {
        if let Some(size) = page_size {
            self.page_size = size.clamp(1, MAX_PAGE_SIZE);
        }
        if let Some(pages) = max_pages {
            self.max_pages = pages.max(1);
        }
        self
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn data_api_config(&self) -> DataApiConfig {
        DataApiConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_credential.clone(),
            page_size: self.page_size,
            max_pages: self.max_pages,
        }
    }
}

/// Optional `channels.yaml` listing the channels to fetch when none are given
/// on the command line.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRegistry {
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ChannelRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("channels.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_ids(&self) -> Vec<String> {
        let joined = self
            .channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        parse_channel_ids(&joined)
    }
}

/// Splits comma-separated free text into trimmed, non-empty, de-duplicated ids
/// in first-seen order.
pub fn parse_channel_ids(input: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in input.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = SyncConfig::default();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.max_pages, 1);
        assert_eq!(config.document_store_uri, "file://./staging");
        assert!(config.api_credential.is_empty());
    }

    #[test]
    fn lookup_values_override_and_clamp() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("YOUTUBE_API_KEY", "k-123"),
            ("TUBESTAGE_PAGE_SIZE", "500"),
            ("TUBESTAGE_MAX_PAGES", "0"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.max_pages, 1);
        assert_eq!(config.relational_store_uri, "sqlite::memory:");
        assert!(!format!("{config:?}").contains("k-123"));
    }

    #[test]
    fn paging_overrides_are_bounded() {
        let config = SyncConfig::default().with_paging(Some(0), Some(5));
        assert_eq!(config.page_size, 1);
        assert_eq!(config.max_pages, 5);
        let untouched = SyncConfig::default().with_paging(None, None);
        assert_eq!(untouched.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn channel_ids_are_trimmed_and_deduplicated() {
        assert_eq!(
            parse_channel_ids(" UC1, ,UC2,UC1 ,"),
            vec!["UC1".to_string(), "UC2".to_string()]
        );
        assert!(parse_channel_ids("  ").is_empty());
    }

    #[test]
    fn registry_skips_disabled_channels() {
        let registry: ChannelRegistry = serde_yaml::from_str(
            "channels:\n  - id: UC1\n    label: first\n  - id: UC2\n    enabled: false\n  - id: UC3\n",
        )
        .unwrap();
        assert_eq!(registry.enabled_ids(), vec!["UC1".to_string(), "UC3".to_string()]);
    }
}
