//! File records: which chunks make up a stored file and where they live
//!
//! Records are keyed by content hash, created once and never modified. When
//! the catalog has a backing path, every insert rewrites the JSON snapshot
//! before returning.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

use crate::registry::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, CatalogError>;

/// One placed chunk of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub node_id: NodeId,
    /// 0-based position within the file
    pub index: usize,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content_hash: String,
    pub filename: String,
    pub size: u64,
    pub chunks: Vec<ChunkRef>,
}

impl FileRecord {
    /// Chunks sorted by file position; stored order is not retrieval order
    pub fn chunks_in_order(&self) -> Vec<ChunkRef> {
        let mut chunks = self.chunks.clone();
        chunks.sort_by_key(|chunk| chunk.index);
        chunks
    }

    /// Positions in `0..N` with no chunk, where N is the highest index + 1
    pub fn missing_indices(&self) -> Vec<usize> {
        let ordered = self.chunks_in_order();
        let expected = ordered.last().map(|c| c.index + 1).unwrap_or(0);
        (0..expected)
            .filter(|i| ordered.binary_search_by_key(i, |c| c.index).is_err())
            .collect()
    }
}

pub struct FileCatalog {
    records: RwLock<HashMap<String, FileRecord>>,
    path: Option<PathBuf>,
}

impl FileCatalog {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Open a persistent catalog, loading existing records if the file exists
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let list: Vec<FileRecord> = serde_json::from_slice(&raw)?;
                list.into_iter()
                    .map(|record| (record.content_hash.clone(), record))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} file records from {:?}", records.len(), path);

        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
        })
    }

    pub async fn get(&self, content_hash: &str) -> Option<FileRecord> {
        self.records.read().await.get(content_hash).cloned()
    }

    pub async fn contains(&self, content_hash: &str) -> bool {
        self.records.read().await.contains_key(content_hash)
    }

    /// Store a new record; returns `false` if the hash is already recorded
    pub async fn insert(&self, record: FileRecord) -> Result<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.content_hash) {
            return Ok(false);
        }
        let hash = record.content_hash.clone();
        records.insert(hash.clone(), record);

        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &records).await {
                records.remove(&hash);
                return Err(e);
            }
        }
        Ok(true)
    }

    pub async fn records(&self) -> Vec<FileRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

async fn persist(path: &Path, records: &HashMap<String, FileRecord>) -> Result<()> {
    let mut list: Vec<&FileRecord> = records.values().collect();
    list.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
    let encoded = serde_json::to_vec_pretty(&list)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, encoded).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
