//! Staging document store: one collection per entity type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use tubestage_core::Record;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing document for `{collection}`: {source}")]
    Serialize {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt document in `{collection}` at line {line}: {source}")]
    Corrupt {
        collection: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("document in `{collection}` is not a JSON object")]
    NotAnObject { collection: String },
    #[error("unsupported document store uri `{0}`")]
    UnsupportedUri(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Insert-many / find-all over JSON documents grouped into named collections.
///
/// `insert_many` is all-or-nothing: when it returns an error none of the batch
/// is visible to a later `find_all`. `find_all` returns documents in insertion
/// order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<JsonValue>,
    ) -> Result<usize, StoreError>;

    async fn find_all(&self, collection: &str) -> Result<Vec<JsonValue>, StoreError>;
}

/// Filesystem store keeping each collection as `<root>/<collection>.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlDocumentStore {
    root: PathBuf,
}

impl JsonlDocumentStore {
    /// Opens (creating if needed) the store directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(io_err(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.jsonl"))
    }
}

#[async_trait]
impl DocumentStore for JsonlDocumentStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        if documents.is_empty() {
            return Ok(0);
        }

        let mut appended = Vec::new();
        for doc in &documents {
            serde_json::to_writer(&mut appended, doc).map_err(|source| StoreError::Serialize {
                collection: collection.to_string(),
                source,
            })?;
            appended.push(b'\n');
        }

        let path = self.collection_path(collection);
        let mut contents = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(io_err(&path)(err)),
        };
        if contents.last().is_some_and(|b| *b != b'\n') {
            contents.push(b'\n');
        }
        contents.extend_from_slice(&appended);

        // Whole-file replace through a temp file so a failed batch leaves the
        // previous contents untouched.
        let temp_path = self
            .root
            .join(format!(".{collection}.{}.tmp", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&contents).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&path)(err));
        }

        info!(collection, inserted = documents.len(), "staged documents");
        Ok(documents.len())
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<JsonValue>, StoreError> {
        let path = self.collection_path(collection);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&path)(err)),
        };

        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| StoreError::Corrupt {
                    collection: collection.to_string(),
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }
}

/// In-process store; contents live as long as the value.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<JsonValue>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        let inserted = documents.len();
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
        Ok(inserted)
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<JsonValue>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }
}

/// Opens a store from `file://<dir>`, a bare directory path, or `memory://`.
pub async fn open_document_store(uri: &str) -> Result<Box<dyn DocumentStore>, StoreError> {
    let uri = uri.trim();
    if uri == "memory://" || uri == "memory" {
        return Ok(Box::new(MemoryDocumentStore::new()));
    }
    let path = match uri.split_once("://") {
        Some(("file", rest)) if !rest.is_empty() => rest,
        Some(_) => return Err(StoreError::UnsupportedUri(uri.to_string())),
        None if !uri.is_empty() => uri,
        None => return Err(StoreError::UnsupportedUri(uri.to_string())),
    };
    Ok(Box::new(JsonlDocumentStore::open(path).await?))
}

/// Stages `records` into the collection for `T`, stamping each document with a
/// generated `_id` and `staged_at`.
pub async fn write_records<T: Record>(
    store: &dyn DocumentStore,
    records: &[T],
) -> Result<usize, StoreError> {
    let collection = T::KIND.collection();
    let staged_at = Utc::now().to_rfc3339();
    let mut documents = Vec::with_capacity(records.len());
    for record in records {
        let value = serde_json::to_value(record).map_err(|source| StoreError::Serialize {
            collection: collection.to_string(),
            source,
        })?;
        let JsonValue::Object(fields) = value else {
            return Err(StoreError::NotAnObject {
                collection: collection.to_string(),
            });
        };
        let mut doc = Map::with_capacity(fields.len() + 2);
        doc.insert("_id".into(), JsonValue::String(Uuid::new_v4().to_string()));
        doc.insert("staged_at".into(), JsonValue::String(staged_at.clone()));
        doc.extend(fields);
        documents.push(JsonValue::Object(doc));
    }
    store.insert_many(collection, documents).await
}

/// Reads back every staged document for `T`, in storage order.
pub async fn read_records<T: Record>(store: &dyn DocumentStore) -> Result<Vec<T>, StoreError> {
    let collection = T::KIND.collection();
    store
        .find_all(collection)
        .await?
        .into_iter()
        .enumerate()
        .map(|(idx, doc)| {
            serde_json::from_value(doc).map_err(|source| StoreError::Corrupt {
                collection: collection.to_string(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use tubestage_core::{Channel, Video};

    fn video(id: &str) -> Video {
        Video {
            video_id: id.to_string(),
            title: format!("title {id}"),
            description: String::new(),
            thumbnail_url: format!("https://i.example/{id}.jpg"),
            channel_title: "Example".into(),
            published_at: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).single().unwrap(),
            channel_id: "UC1".into(),
        }
    }

    #[tokio::test]
    async fn jsonl_store_round_trips_in_insertion_order() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlDocumentStore::open(dir.path()).await.expect("open");

        write_records(&store, &[video("a"), video("b")]).await.expect("first batch");
        write_records(&store, &[video("c")]).await.expect("second batch");

        let back: Vec<Video> = read_records(&store).await.expect("read");
        let ids: Vec<_> = back.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(back[0], video("a"));
        assert!(store.collection_path("videos").exists());
    }

    #[tokio::test]
    async fn staging_is_not_idempotent() {
        let store = MemoryDocumentStore::new();
        write_records(&store, &[video("a")]).await.unwrap();
        write_records(&store, &[video("a")]).await.unwrap();

        let docs = store.find_all("videos").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_ne!(docs[0]["_id"], docs[1]["_id"]);
        assert!(docs[0]["staged_at"].is_string());
    }

    #[tokio::test]
    async fn missing_collection_reads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlDocumentStore::open(dir.path()).await.expect("open");
        let channels: Vec<Channel> = read_records(&store).await.expect("read");
        assert!(channels.is_empty());
    }

    #[tokio::test]
    async fn corrupt_line_is_reported_with_position() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlDocumentStore::open(dir.path()).await.expect("open");
        write_records(&store, &[video("a")]).await.unwrap();
        let path = store.collection_path("videos");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{not json\n");
        std::fs::write(&path, text).unwrap();

        let err = store.find_all("videos").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 2, .. }));
    }

    #[tokio::test]
    async fn uri_selects_backend() {
        let dir = tempdir().expect("tempdir");
        let uri = format!("file://{}", dir.path().join("staging").display());
        let store = open_document_store(&uri).await.expect("file store");
        store
            .insert_many("channels", vec![serde_json::json!({"channel_id": "UC1"})])
            .await
            .unwrap();
        assert!(dir.path().join("staging/channels.jsonl").exists());

        let mem = open_document_store("memory://").await.expect("memory store");
        assert!(mem.find_all("channels").await.unwrap().is_empty());

        assert!(matches!(
            open_document_store("mongodb://localhost:27017").await,
            Err(StoreError::UnsupportedUri(_))
        ));
    }
}
