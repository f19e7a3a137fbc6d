//! Fetch pass, staging and migration for one sync run.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use tubestage_adapters::{
    normalize_channel, normalize_comment, normalize_playlist, normalize_video, ApiError,
    DataApiClient, MetadataApi,
};
use tubestage_core::{EntityKind, Record, RecordBatch};
use tubestage_storage::{
    open_document_store, read_records, write_records, DocumentStore, HttpFetcher, StoreError,
};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::relational::{RelationalStore, UpsertReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The channel lookup returned no items.
    NotFound,
    /// One API item could not be mapped and was skipped.
    Mapping,
    /// A sub-resource (or the channel lookup itself) failed and was omitted.
    PartialFetch,
    /// The API quota ran out; the pass stopped issuing calls.
    QuotaExhausted,
    /// The document store rejected one entity batch.
    Staging,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IssueKind::NotFound => "not found",
            IssueKind::Mapping => "mapping",
            IssueKind::PartialFetch => "partial fetch",
            IssueKind::QuotaExhausted => "quota exhausted",
            IssueKind::Staging => "staging",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

impl RunIssue {
    fn new(kind: IssueKind, subject: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            subject: subject.into(),
            detail: detail.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub batch: RecordBatch,
    pub issues: Vec<RunIssue>,
    /// Set once the quota is spent; channels after that point were not fetched.
    pub halted: bool,
}

impl FetchOutcome {
    fn record_issue(&mut self, issue: RunIssue) {
        warn!(kind = %issue.kind, subject = %issue.subject, detail = %issue.detail, "skipping");
        self.issues.push(issue);
    }

    /// Records a failed list or lookup call. Quota exhaustion halts the pass
    /// but keeps what was collected; credential and transport failures abort.
    fn absorb(&mut self, subject: String, err: ApiError) -> Result<()> {
        if err.is_quota() {
            self.halted = true;
            self.record_issue(RunIssue::new(IssueKind::QuotaExhausted, subject, err));
            return Ok(());
        }
        if err.is_fatal() {
            return Err(anyhow::Error::new(err).context(format!("fetching {subject}")));
        }
        self.record_issue(RunIssue::new(IssueKind::PartialFetch, subject, err));
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageReport {
    pub staged: BTreeMap<EntityKind, usize>,
    pub issues: Vec<RunIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationReport {
    /// Per table; `skipped` includes staged duplicates collapsed before insert.
    pub upserts: Vec<UpsertReport>,
    pub staged_duplicates: BTreeMap<EntityKind, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    CompletedWithIssues,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::CompletedWithIssues => "completed with issues",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityTotals {
    pub fetched: usize,
    pub staged: usize,
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels_requested: usize,
    pub entities: BTreeMap<EntityKind, EntityTotals>,
    pub issues: Vec<RunIssue>,
    pub status: RunStatus,
}

impl SyncRunSummary {
    pub fn status_line(&self) -> String {
        let totals = self
            .entities
            .iter()
            .map(|(kind, t)| {
                format!(
                    "{kind}: fetched={} staged={} inserted={} skipped={}",
                    t.fetched, t.staged, t.inserted, t.skipped
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        format!(
            "run {} {} ({} issue(s)) {totals}",
            self.run_id,
            self.status,
            self.issues.len()
        )
    }
}

/// Keeps the first occurrence of each natural key; returns the number dropped.
pub fn dedup_by_natural_key<T: Record>(records: Vec<T>) -> (Vec<T>, usize) {
    let before = records.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<T> = records
        .into_iter()
        .filter(|r| seen.insert(r.natural_key().to_string()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

pub struct SyncPipeline {
    config: SyncConfig,
    api: Arc<dyn MetadataApi>,
    documents: Box<dyn DocumentStore>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn MetadataApi>,
        documents: Box<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            api,
            documents,
        }
    }

    /// Wires the Data API client and the configured document store.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let api = DataApiClient::new(http, config.data_api_config());
        let documents = open_document_store(&config.document_store_uri)
            .await
            .with_context(|| format!("opening document store {}", config.document_store_uri))?;
        Ok(Self::new(config, Arc::new(api), documents))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn documents(&self) -> &dyn DocumentStore {
        self.documents.as_ref()
    }

    /// Fetches and normalizes every channel in order, one at a time.
    ///
    /// Entity-level failures become issues. A connection failure or a rejected
    /// credential aborts the pass; an exhausted quota stops it early and keeps
    /// everything fetched so far.
    pub async fn fetch_pass(&self, channel_ids: &[String]) -> Result<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        for (done, channel_id) in channel_ids.iter().enumerate() {
            self.fetch_channel(channel_id, &mut outcome)
                .instrument(info_span!("fetch_channel", channel_id = %channel_id))
                .await?;
            if outcome.halted {
                warn!(
                    remaining = channel_ids.len() - done - 1,
                    "quota exhausted, stopping fetch pass"
                );
                break;
            }
        }
        info!(
            channels = outcome.batch.channels.len(),
            videos = outcome.batch.videos.len(),
            playlists = outcome.batch.playlists.len(),
            comments = outcome.batch.comments.len(),
            issues = outcome.issues.len(),
            "fetch pass complete"
        );
        Ok(outcome)
    }

    async fn fetch_channel(&self, channel_id: &str, outcome: &mut FetchOutcome) -> Result<()> {
        let raw = match self.api.channel(channel_id).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                outcome.record_issue(RunIssue::new(
                    IssueKind::NotFound,
                    channel_id,
                    "channel lookup returned no items",
                ));
                return Ok(());
            }
            Err(err) => return outcome.absorb(channel_id.to_string(), err),
        };
        let channel = match normalize_channel(channel_id, &raw) {
            Ok(channel) => channel,
            Err(err) => {
                outcome.record_issue(RunIssue::new(IssueKind::Mapping, channel_id, err));
                return Ok(());
            }
        };
        let channel_id = channel.channel_id.clone();
        outcome.batch.channels.push(channel);

        let mut videos = Vec::new();
        match self.api.channel_videos(&channel_id).await {
            Ok(items) => {
                for item in &items {
                    match normalize_video(&channel_id, item) {
                        Ok(video) => videos.push(video),
                        Err(err) => outcome.record_issue(RunIssue::new(
                            IssueKind::Mapping,
                            format!("{channel_id}/videos"),
                            err,
                        )),
                    }
                }
            }
            Err(err) => {
                outcome.absorb(format!("{channel_id}/videos"), err)?;
                if outcome.halted {
                    return Ok(());
                }
            }
        }

        for video in &videos {
            match self.api.comment_threads(&video.video_id).await {
                Ok(threads) => {
                    for thread in &threads {
                        match normalize_comment(&channel_id, &video.video_id, thread) {
                            Ok(comment) => outcome.batch.comments.push(comment),
                            Err(err) => outcome.record_issue(RunIssue::new(
                                IssueKind::Mapping,
                                format!("{}/comments", video.video_id),
                                err,
                            )),
                        }
                    }
                }
                Err(err) if err.is_connection() => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("fetching {}/comments", video.video_id)));
                }
                Err(err) => outcome.record_issue(RunIssue::new(
                    IssueKind::PartialFetch,
                    format!("{}/comments", video.video_id),
                    err,
                )),
            }
        }
        outcome.batch.videos.extend(videos);

        match self.api.channel_playlists(&channel_id).await {
            Ok(items) => {
                for item in &items {
                    match normalize_playlist(&channel_id, item) {
                        Ok(playlist) => outcome.batch.playlists.push(playlist),
                        Err(err) => outcome.record_issue(RunIssue::new(
                            IssueKind::Mapping,
                            format!("{channel_id}/playlists"),
                            err,
                        )),
                    }
                }
            }
            Err(err) => outcome.absorb(format!("{channel_id}/playlists"), err)?,
        }
        Ok(())
    }

    /// Writes each entity type as one batch. A rejected batch is reported and
    /// the next entity type still runs.
    pub async fn stage(&self, batch: &RecordBatch) -> Result<StageReport> {
        let mut report = StageReport::default();
        for kind in EntityKind::ALL {
            let docs = self.documents.as_ref();
            let written = match kind {
                EntityKind::Channel => write_records(docs, &batch.channels).await,
                EntityKind::Video => write_records(docs, &batch.videos).await,
                EntityKind::Playlist => write_records(docs, &batch.playlists).await,
                EntityKind::Comment => write_records(docs, &batch.comments).await,
            };
            match written {
                Ok(count) => {
                    report.staged.insert(kind, count);
                }
                Err(err) => {
                    warn!(collection = kind.collection(), error = %err, "staging batch rejected");
                    report.staged.insert(kind, 0);
                    report
                        .issues
                        .push(RunIssue::new(IssueKind::Staging, kind.collection(), err));
                }
            }
        }
        Ok(report)
    }

    /// Reads back all four collections. `None` keeps everything; `Some(ids)`
    /// keeps only records owned by those channels, so an empty list keeps none.
    pub async fn load_staged(&self, channel_filter: Option<&[String]>) -> Result<RecordBatch> {
        let docs = self.documents.as_ref();
        let mut batch = RecordBatch {
            channels: read_records(docs).await.map_err(staged_read_error)?,
            videos: read_records(docs).await.map_err(staged_read_error)?,
            playlists: read_records(docs).await.map_err(staged_read_error)?,
            comments: read_records(docs).await.map_err(staged_read_error)?,
        };
        if let Some(ids) = channel_filter {
            batch.retain_channels(ids);
        }
        Ok(batch)
    }

    /// Copies staged records into the relational store, collapsing staged
    /// duplicates first. The whole copy commits or rolls back as one unit.
    pub async fn migrate(
        &self,
        store: &RelationalStore,
        channel_filter: Option<&[String]>,
    ) -> Result<MigrationReport> {
        store.ensure_schema().await?;
        let staged = self.load_staged(channel_filter).await?;

        let mut staged_duplicates = BTreeMap::new();
        let (channels, dup) = dedup_by_natural_key(staged.channels);
        staged_duplicates.insert(EntityKind::Channel, dup);
        let (videos, dup) = dedup_by_natural_key(staged.videos);
        staged_duplicates.insert(EntityKind::Video, dup);
        let (playlists, dup) = dedup_by_natural_key(staged.playlists);
        staged_duplicates.insert(EntityKind::Playlist, dup);
        let (comments, dup) = dedup_by_natural_key(staged.comments);
        staged_duplicates.insert(EntityKind::Comment, dup);

        let unique = RecordBatch {
            channels,
            videos,
            playlists,
            comments,
        };
        let mut upserts = store.migrate_batch(&unique).await?;
        for report in &mut upserts {
            report.skipped += staged_duplicates.get(&report.kind).copied().unwrap_or(0);
        }
        Ok(MigrationReport {
            upserts,
            staged_duplicates,
        })
    }

    /// Fetch, stage and migrate the given channels; the returned summary
    /// carries the single aggregate status of the run.
    pub async fn run_once(
        &self,
        store: &RelationalStore,
        channel_ids: &[String],
    ) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, channels = channel_ids.len(), "sync run started");

        let fetched = self.fetch_pass(channel_ids).await?;
        let staged = self.stage(&fetched.batch).await?;
        let migrated = self.migrate(store, Some(channel_ids)).await?;

        let mut entities = BTreeMap::new();
        for kind in EntityKind::ALL {
            let upsert = migrated.upserts.iter().find(|r| r.kind == kind);
            entities.insert(
                kind,
                EntityTotals {
                    fetched: fetched.batch.len_of(kind),
                    staged: staged.staged.get(&kind).copied().unwrap_or(0),
                    inserted: upsert.map(|r| r.inserted).unwrap_or(0),
                    skipped: upsert.map(|r| r.skipped).unwrap_or(0),
                },
            );
        }

        let mut issues = fetched.issues;
        issues.extend(staged.issues);
        let status = if issues.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::CompletedWithIssues
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            channels_requested: channel_ids.len(),
            entities,
            issues,
            status,
        };
        info!(%run_id, status = %summary.status, issues = summary.issues.len(), "sync run finished");
        Ok(summary)
    }

    /// Writes `reports/<run_id>.json` under the workspace root.
    pub async fn write_run_report(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.workspace_root.join("reports");
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let path = reports_dir.join(format!("{}.json", summary.run_id));
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

fn staged_read_error(err: StoreError) -> anyhow::Error {
    anyhow::Error::new(err).context("reading staged documents")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubestage_core::Channel;

    fn channel(id: &str, name: &str) -> Channel {
        Channel {
            channel_id: id.into(),
            name: name.into(),
            subscriber_count: 0,
            video_count: 0,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let (kept, dropped) = dedup_by_natural_key(vec![
            channel("UC1", "first"),
            channel("UC2", "other"),
            channel("UC1", "second"),
        ]);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].name, "first");
    }

    #[test]
    fn status_line_mentions_every_entity() {
        let mut entities = BTreeMap::new();
        for kind in EntityKind::ALL {
            entities.insert(kind, EntityTotals::default());
        }
        let summary = SyncRunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            channels_requested: 0,
            entities,
            issues: Vec::new(),
            status: RunStatus::Succeeded,
        };
        let line = summary.status_line();
        assert!(line.contains("succeeded"));
        for kind in EntityKind::ALL {
            assert!(line.contains(kind.collection()));
        }
    }
}
