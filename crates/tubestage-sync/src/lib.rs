//! Pipeline orchestration: fetch pass, staging, relational migration.

pub mod config;
pub mod pipeline;
pub mod relational;

pub use config::{parse_channel_ids, ChannelEntry, ChannelRegistry, SyncConfig, DEFAULT_PAGE_SIZE};
pub use pipeline::{
    dedup_by_natural_key, EntityTotals, FetchOutcome, IssueKind, MigrationReport, RunIssue,
    RunStatus, StageReport, SyncPipeline, SyncRunSummary,
};
pub use relational::{insert_sql, table_ddl, RelationalRecord, RelationalStore, TableView, UpsertReport};

pub const CRATE_NAME: &str = "tubestage-sync";

/// Resolves the channels for a run: explicit ids win, otherwise the enabled
/// entries of `channels.yaml`.
pub fn resolve_channel_ids(config: &SyncConfig, explicit: Option<&str>) -> anyhow::Result<Vec<String>> {
    match explicit {
        Some(list) => Ok(parse_channel_ids(list)),
        None => Ok(ChannelRegistry::load(&config.workspace_root)?.enabled_ids()),
    }
}

