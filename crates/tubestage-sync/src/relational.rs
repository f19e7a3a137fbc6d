//! Relational copy of the staged records, and the read side the dashboard uses.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, TypeInfo, ValueRef};
use tracing::{info, warn};
use tubestage_core::{Channel, Comment, EntityKind, Playlist, Record, RecordBatch, Video};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const CHANNEL_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS channel_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    subscriber_count INTEGER NOT NULL DEFAULT 0,
    video_count INTEGER NOT NULL DEFAULT 0
)"#;

const VIDEO_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS video_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    thumbnail_url TEXT NOT NULL DEFAULT '',
    channel_title TEXT NOT NULL DEFAULT '',
    published_at TEXT NOT NULL,
    channel_id TEXT NOT NULL
)"#;

const PLAYLIST_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS playlist_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    playlist_id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    channel_title TEXT NOT NULL DEFAULT '',
    item_count INTEGER NOT NULL DEFAULT 0,
    channel_id TEXT NOT NULL
)"#;

const COMMENT_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS comment_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    comment_id TEXT NOT NULL UNIQUE,
    video_id TEXT NOT NULL,
    author TEXT NOT NULL DEFAULT '',
    text TEXT NOT NULL DEFAULT '',
    like_count INTEGER NOT NULL DEFAULT 0,
    published_at TEXT NOT NULL,
    channel_id TEXT NOT NULL
)"#;

pub fn table_ddl(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Channel => CHANNEL_DDL,
        EntityKind::Video => VIDEO_DDL,
        EntityKind::Playlist => PLAYLIST_DDL,
        EntityKind::Comment => COMMENT_DDL,
    }
}

/// Insert-or-skip statement keyed on the natural key column.
pub fn insert_sql(kind: EntityKind) -> String {
    let columns = kind.columns();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO NOTHING",
        kind.table(),
        columns.join(", "),
        placeholders,
        kind.natural_key()
    )
}

fn timestamp_text(at: &chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A record that knows how to bind its values in `EntityKind::columns` order.
pub trait RelationalRecord: Record {
    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

impl RelationalRecord for Channel {
    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.channel_id.as_str())
            .bind(self.name.as_str())
            .bind(self.subscriber_count)
            .bind(self.video_count)
    }
}

impl RelationalRecord for Video {
    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.video_id.as_str())
            .bind(self.title.as_str())
            .bind(self.description.as_str())
            .bind(self.thumbnail_url.as_str())
            .bind(self.channel_title.as_str())
            .bind(timestamp_text(&self.published_at))
            .bind(self.channel_id.as_str())
    }
}

impl RelationalRecord for Playlist {
    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.playlist_id.as_str())
            .bind(self.title.as_str())
            .bind(self.description.as_str())
            .bind(self.channel_title.as_str())
            .bind(self.item_count)
            .bind(self.channel_id.as_str())
    }
}

impl RelationalRecord for Comment {
    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.comment_id.as_str())
            .bind(self.video_id.as_str())
            .bind(self.author.as_str())
            .bind(self.text.as_str())
            .bind(self.like_count)
            .bind(timestamp_text(&self.published_at))
            .bind(self.channel_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub kind: EntityKind,
    pub inserted: usize,
    pub skipped: usize,
}

/// Column names plus every row rendered as text; NULL renders as "".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableView {
    pub kind: EntityKind,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: SqlitePool,
}

impl RelationalStore {
    /// Opens `uri` (creating the database file if absent) with a single
    /// connection, which also keeps `sqlite::memory:` alive for the pool's life.
    pub async fn connect(uri: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(uri)
            .with_context(|| format!("parsing relational store uri {uri}"))?
            .create_if_missing(true);
        Self::open(uri, options).await
    }

    /// Opens an existing database for reading only; writes and DDL fail.
    pub async fn connect_read_only(uri: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(uri)
            .with_context(|| format!("parsing relational store uri {uri}"))?
            .read_only(true);
        Self::open(uri, options).await
    }

    async fn open(uri: &str, options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {uri}"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            sqlx::query(table_ddl(kind))
                .execute(&self.pool)
                .await
                .with_context(|| format!("creating table {}", kind.table()))?;
        }
        Ok(())
    }

    /// Inserts every record whose natural key is not present yet, in one
    /// transaction. Existing rows are left untouched.
    pub async fn upsert<T: RelationalRecord>(&self, records: &[T]) -> Result<UpsertReport> {
        let mut tx = self.pool.begin().await.context("beginning upsert transaction")?;
        match insert_all(&mut tx, records).await {
            Ok(report) => {
                tx.commit().await.context("committing upsert")?;
                info!(
                    table = T::KIND.table(),
                    inserted = report.inserted,
                    skipped = report.skipped,
                    "upserted records"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Copies a whole batch, parents before children, all-or-nothing.
    pub async fn migrate_batch(&self, batch: &RecordBatch) -> Result<Vec<UpsertReport>> {
        let mut tx = self.pool.begin().await.context("beginning migration transaction")?;
        let result = async {
            Ok::<_, anyhow::Error>(vec![
                insert_all(&mut tx, &batch.channels).await?,
                insert_all(&mut tx, &batch.videos).await?,
                insert_all(&mut tx, &batch.playlists).await?,
                insert_all(&mut tx, &batch.comments).await?,
            ])
        }
        .await;

        match result {
            Ok(reports) => {
                tx.commit().await.context("committing migration")?;
                for report in &reports {
                    info!(
                        table = report.kind.table(),
                        inserted = report.inserted,
                        skipped = report.skipped,
                        "migrated records"
                    );
                }
                Ok(reports)
            }
            Err(err) => {
                warn!(error = %err, "migration failed, rolling back the whole run");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub async fn count(&self, kind: EntityKind) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting {}", kind.table()))
    }

    pub async fn table_exists(&self, kind: EntityKind) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(kind.table())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("looking up table {}", kind.table()))?;
        Ok(found > 0)
    }

    /// Every row of one table as text. A table nothing has migrated into yet
    /// reads as empty.
    pub async fn select_all(&self, kind: EntityKind) -> Result<TableView> {
        let mut columns = vec!["id".to_string()];
        columns.extend(kind.columns().iter().map(|c| c.to_string()));
        if !self.table_exists(kind).await? {
            return Ok(TableView {
                kind,
                columns,
                rows: Vec::new(),
            });
        }
        let sql = format!("SELECT {} FROM {}", columns.join(", "), kind.table());
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("reading {}", kind.table()))?;

        let rows = rows
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|idx| cell_text(row, idx))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("decoding rows of {}", kind.table()))?;

        Ok(TableView { kind, columns, rows })
    }
}

async fn insert_all<T: RelationalRecord>(
    conn: &mut SqliteConnection,
    records: &[T],
) -> Result<UpsertReport> {
    let sql = insert_sql(T::KIND);
    let mut inserted = 0usize;
    for record in records {
        let result = record
            .bind_values(sqlx::query(&sql))
            .execute(&mut *conn)
            .await
            .with_context(|| {
                format!("inserting {} {}", T::KIND.table(), record.natural_key())
            })?;
        inserted += result.rows_affected() as usize;
    }
    Ok(UpsertReport {
        kind: T::KIND,
        inserted,
        skipped: records.len() - inserted,
    })
}

fn cell_text(row: &SqliteRow, idx: usize) -> Result<String, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(String::new());
    }
    let type_name = raw.type_info().name().to_string();
    match type_name.as_str() {
        "INTEGER" => Ok(row.try_get::<i64, _>(idx)?.to_string()),
        "REAL" => Ok(row.try_get::<f64, _>(idx)?.to_string()),
        _ => row.try_get::<String, _>(idx),
    }
}
