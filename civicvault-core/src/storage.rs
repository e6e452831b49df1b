//! Partition-backed chunk storage for a single node
//!
//! Every node owns a fixed window of one shared backing file. Chunks are
//! appended at the node's write cursor and located through a FAT (chunk id to
//! relative offset and size) that is written through to a JSON index file
//! after each successful data write. Space is never reclaimed and entries are
//! never rewritten or moved.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::protocol::{ErrorCode, PartitionAssignment};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No partition has been assigned to this node")]
    NotProvisioned,

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Chunk {chunk_id} already stored with {existing} bytes, refusing {requested} bytes")]
    ChunkExists {
        chunk_id: String,
        existing: u64,
        requested: u64,
    },

    #[error("Partition full: {requested} bytes requested, {available} available")]
    PartitionFull { requested: u64, available: u64 },

    #[error("Partition already assigned as {current:?}, refusing {requested:?}")]
    PartitionConflict {
        current: PartitionAssignment,
        requested: PartitionAssignment,
    },

    #[error("Recovered chunks end at {cursor}, beyond partition size {size}")]
    CursorBeyondPartition { cursor: u64, size: u64 },

    #[error("Index error: {0}")]
    Index(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Wire code reported to the manager for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::NotProvisioned => ErrorCode::NotProvisioned,
            StorageError::ChunkNotFound(_) => ErrorCode::ChunkNotFound,
            StorageError::ChunkExists { .. } => ErrorCode::ChunkExists,
            StorageError::PartitionFull { .. } => ErrorCode::PartitionFull,
            StorageError::PartitionConflict { .. }
            | StorageError::CursorBeyondPartition { .. } => ErrorCode::PartitionConflict,
            StorageError::Index(_) | StorageError::IoError(_) | StorageError::LockPoisoned => {
                ErrorCode::Internal
            }
        }
    }
}

type Result<T> = std::result::Result<T, StorageError>;

/// Location of one chunk relative to the start of the partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatEntry {
    pub offset: u64,
    pub size: u64,
}

impl FatEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Snapshot of a node's storage usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub partition: Option<PartitionAssignment>,
    pub chunk_count: usize,
    pub used_bytes: u64,
}

struct StoreState {
    partition: Option<PartitionAssignment>,
    fat: BTreeMap<String, FatEntry>,
    cursor: u64,
}

/// Append-only chunk store over one partition of the shared backing file
///
/// All operations take the same lock, so the cursor is read, used and
/// advanced as a single step.
pub struct PartitionStore {
    disk_path: PathBuf,
    index_path: PathBuf,
    state: Mutex<StoreState>,
}

impl PartitionStore {
    /// Open the store, recovering the FAT and write cursor from the index file
    ///
    /// The store starts unprovisioned; reads and writes are rejected until
    /// [`PartitionStore::assign`] is called.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(disk_path: P, index_path: Q) -> Result<Self> {
        let index_path = index_path.as_ref().to_path_buf();
        let fat = load_index(&index_path)?;
        let cursor = recover_cursor(&fat);

        info!(
            "Opened partition store {:?} ({} chunks, cursor {})",
            index_path,
            fat.len(),
            cursor
        );

        Ok(Self {
            disk_path: disk_path.as_ref().to_path_buf(),
            index_path,
            state: Mutex::new(StoreState {
                partition: None,
                fat,
                cursor,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Accept a partition assignment
    ///
    /// Returns `true` when the assignment is new and `false` when it repeats
    /// the current one. A different assignment is refused.
    pub fn assign(&self, assignment: PartitionAssignment) -> Result<bool> {
        let mut state = self.lock()?;
        match state.partition {
            Some(current) if current == assignment => return Ok(false),
            Some(current) => {
                return Err(StorageError::PartitionConflict {
                    current,
                    requested: assignment,
                })
            }
            None => {}
        }
        if state.cursor > assignment.size {
            return Err(StorageError::CursorBeyondPartition {
                cursor: state.cursor,
                size: assignment.size,
            });
        }
        state.partition = Some(assignment);
        info!(
            "Partition assigned: start={} size={}MB",
            assignment.offset,
            assignment.size / 1024 / 1024
        );
        Ok(true)
    }

    pub fn partition(&self) -> Result<Option<PartitionAssignment>> {
        Ok(self.lock()?.partition)
    }

    /// Append a chunk at the write cursor and record it in the FAT
    ///
    /// Re-sending an id already stored with the same size is acknowledged
    /// without touching the disk.
    pub fn write(&self, chunk_id: &str, data: &[u8]) -> Result<u64> {
        let mut state = self.lock()?;
        let partition = state.partition.ok_or(StorageError::NotProvisioned)?;
        let size = data.len() as u64;

        if let Some(existing) = state.fat.get(chunk_id) {
            if existing.size == size {
                debug!("Chunk {} already stored, skipping write", chunk_id);
                return Ok(size);
            }
            return Err(StorageError::ChunkExists {
                chunk_id: chunk_id.to_string(),
                existing: existing.size,
                requested: size,
            });
        }

        let available = partition.size.saturating_sub(state.cursor);
        if size > available {
            return Err(StorageError::PartitionFull {
                requested: size,
                available,
            });
        }

        let entry = FatEntry {
            offset: state.cursor,
            size,
        };
        let absolute = partition.offset + entry.offset;

        let mut disk = OpenOptions::new().write(true).open(&self.disk_path)?;
        disk.seek(SeekFrom::Start(absolute))?;
        disk.write_all(data)?;
        disk.flush()?;

        // Data first, index second: a crash in between loses this chunk only
        state.fat.insert(chunk_id.to_string(), entry);
        if let Err(e) = persist_index(&self.index_path, &state.fat) {
            state.fat.remove(chunk_id);
            return Err(e);
        }
        state.cursor = entry.end();

        info!("Wrote {}b to disk offset {}", size, absolute);
        Ok(size)
    }

    /// Read exactly the bytes recorded for `chunk_id`
    pub fn read(&self, chunk_id: &str) -> Result<Vec<u8>> {
        let state = self.lock()?;
        let partition = state.partition.ok_or(StorageError::NotProvisioned)?;
        let entry = *state
            .fat
            .get(chunk_id)
            .ok_or_else(|| StorageError::ChunkNotFound(chunk_id.to_string()))?;
        let absolute = partition.offset + entry.offset;

        let mut disk = OpenOptions::new().read(true).open(&self.disk_path)?;
        disk.seek(SeekFrom::Start(absolute))?;
        let mut data = vec![0u8; entry.size as usize];
        disk.read_exact(&mut data)?;

        debug!("Read {}b from disk offset {}", entry.size, absolute);
        Ok(data)
    }

    pub fn entry(&self, chunk_id: &str) -> Result<Option<FatEntry>> {
        Ok(self.lock()?.fat.get(chunk_id).copied())
    }

    /// Next free offset relative to the partition start
    pub fn cursor(&self) -> Result<u64> {
        Ok(self.lock()?.cursor)
    }

    pub fn stats(&self) -> Result<PartitionStats> {
        let state = self.lock()?;
        Ok(PartitionStats {
            partition: state.partition,
            chunk_count: state.fat.len(),
            used_bytes: state.cursor,
        })
    }
}

/// Recovered write cursor: the furthest end of any FAT entry
///
/// Index order says nothing about disk order, so this is a max over all
/// entries rather than the end of the last one.
pub fn recover_cursor(fat: &BTreeMap<String, FatEntry>) -> u64 {
    fat.values().map(FatEntry::end).max().unwrap_or(0)
}

/// Create the shared backing file, or grow it to `total_size`
///
/// Never shrinks an existing file.
pub fn ensure_backing_file<P: AsRef<Path>>(path: P, total_size: u64) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let current = file.metadata()?.len();
    if current < total_size {
        file.set_len(total_size)?;
        info!(
            "Provisioned backing file {:?} at {} bytes",
            path, total_size
        );
    }
    Ok(())
}

fn load_index(path: &Path) -> Result<BTreeMap<String, FatEntry>> {
    match fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn persist_index(path: &Path, fat: &BTreeMap<String, FatEntry>) -> Result<()> {
    let encoded = serde_json::to_vec(fat)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, encoded)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
