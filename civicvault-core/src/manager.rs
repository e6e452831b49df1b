//! Chunk distribution, retrieval and cluster administration
//!
//! [`CloudManager`] is the manager-side entry point. It splits payloads into
//! chunks, places chunk `i` on `snapshot[i mod N]` of the online nodes (in
//! ascending id order), records the placement as an immutable
//! [`FileRecord`], and reassembles files strictly in chunk-index order.
//!
//! Failure policy:
//! - `distribute` aborts with [`CloudError::PartialWriteFailure`] when any
//!   chunk cannot be placed, and stores no record.
//! - `retrieve` fails closed with [`CloudError::Incomplete`] when any chunk
//!   cannot be fetched; [`RetrievalMode::BestEffort`] is an explicit opt-in
//!   that reports what is missing.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, ChunkRef, FileCatalog, FileRecord};
use crate::chunker::{chunk_id, content_hash, Chunker};
use crate::client::{ClientError, NodeClient};
use crate::config::{Config, ConfigError};
use crate::listener::{Membership, MembershipError};
use crate::metrics::Metrics;
use crate::protocol::PartitionAssignment;
use crate::registry::{NodeId, NodeInfo, PartitionLayout, Registry, RegistryError};
use crate::supervisor::{NodeSupervisor, SupervisorError};

/// A chunk that could not be placed or fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: usize,
    pub chunk_id: String,
    pub node_id: NodeId,
    pub reason: String,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} ({}) on node {}: {}",
            self.index, self.chunk_id, self.node_id, self.reason
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("No nodes online")]
    NoNodesOnline,

    #[error("{} of {total} chunks failed to store for {hash}", .failures.len())]
    PartialWriteFailure {
        hash: String,
        total: usize,
        failures: Vec<ChunkFailure>,
    },

    #[error("Network failure talking to node {node_id}: {source}")]
    NetworkFailure {
        node_id: NodeId,
        #[source]
        source: ClientError,
    },

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("{} of {total} chunks could not be recovered for {hash}", .missing.len())]
    Incomplete {
        hash: String,
        total: usize,
        missing: Vec<ChunkFailure>,
    },

    #[error("Reassembled content hashes to {actual}, expected {expected}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl From<MembershipError> for CloudError {
    fn from(err: MembershipError) -> Self {
        match err {
            MembershipError::Registry(e) => CloudError::Registry(e),
            MembershipError::Delivery { id, source, .. } => CloudError::NetworkFailure {
                node_id: id,
                source,
            },
        }
    }
}

type Result<T> = std::result::Result<T, CloudError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalMode {
    /// Fail with `Incomplete` unless every chunk is recovered
    #[default]
    Strict,
    /// Return the chunks that could be recovered, in order, and list the rest
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct Retrieved {
    pub data: Bytes,
    pub filename: String,
    /// Always empty in strict mode
    pub missing: Vec<ChunkFailure>,
}

impl Retrieved {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Row of the node listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub address: Option<SocketAddr>,
    pub partition: PartitionAssignment,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub id: NodeId,
    pub online: bool,
    pub address: Option<SocketAddr>,
    pub partition: PartitionAssignment,
    pub used_bytes: u64,
    pub chunk_count: usize,
    /// Whether the supervisor reports the node's process as running
    pub supervised: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminStats {
    pub total_storage: u64,
    pub used_storage: u64,
    pub file_count: usize,
    pub nodes: Vec<NodeStats>,
}

/// A chunk as seen from the node holding it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeChunk {
    pub filename: String,
    pub chunk_id: String,
    pub index: usize,
    pub size: u64,
}

pub struct CloudManager {
    config: Config,
    membership: Membership,
    catalog: Arc<FileCatalog>,
    client: NodeClient,
    chunker: Chunker,
    supervisor: Arc<dyn NodeSupervisor>,
    /// Ordinals started through the supervisor
    managed: RwLock<BTreeSet<NodeId>>,
    metrics: Metrics,
}

impl CloudManager {
    pub fn new(
        config: Config,
        catalog: FileCatalog,
        supervisor: Arc<dyn NodeSupervisor>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = PartitionLayout::from_config(&config)?;
        let client = NodeClient::from_config(&config);
        let metrics = Metrics::new();
        let membership = Membership::new(Registry::new(), layout, client.clone(), metrics.clone());

        Ok(Self {
            chunker: Chunker::new(config.chunk_size),
            config,
            membership,
            catalog: Arc::new(catalog),
            client,
            supervisor,
            managed: RwLock::new(BTreeSet::new()),
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn registry(&self) -> &Registry {
        self.membership.registry()
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Split `payload` into chunks, place them and record the file
    ///
    /// Returns the content hash. A payload that is already recorded returns
    /// its existing hash without contacting any node.
    pub async fn distribute(&self, payload: Bytes, filename: &str) -> Result<String> {
        let hash = content_hash(&payload);
        if self.catalog.contains(&hash).await {
            info!("{} already stored as {}", filename, hash);
            return Ok(hash);
        }

        let snapshot = self.registry().snapshot().await;
        if snapshot.is_empty() {
            return Err(CloudError::NoNodesOnline);
        }

        let chunks = self.chunker.split(&payload);
        let total = chunks.len();
        info!(
            "Distributing {} ({} bytes) as {} chunks over {} nodes",
            filename,
            payload.len(),
            total,
            snapshot.len()
        );

        let placements: Vec<(usize, NodeInfo, Bytes)> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, data)| (index, snapshot[index % snapshot.len()].clone(), data))
            .collect();

        let results: Vec<std::result::Result<ChunkRef, ChunkFailure>> = stream::iter(placements)
            .map(|(index, node, data)| self.place_chunk(&hash, index, node, data))
            .buffered(self.config.max_inflight)
            .collect()
            .await;

        let mut refs = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(chunk) => refs.push(chunk),
                Err(failure) => failures.push(failure),
            }
        }

        if !failures.is_empty() {
            for failure in &failures {
                warn!("Placement failed: {}", failure);
            }
            return Err(CloudError::PartialWriteFailure {
                hash,
                total,
                failures,
            });
        }

        let record = FileRecord {
            content_hash: hash.clone(),
            filename: filename.to_string(),
            size: payload.len() as u64,
            chunks: refs,
        };
        self.catalog.insert(record).await?;
        self.metrics.file_stored();

        info!("Stored {} as {}", filename, hash);
        Ok(hash)
    }

    async fn place_chunk(
        &self,
        hash: &str,
        index: usize,
        node: NodeInfo,
        data: Bytes,
    ) -> std::result::Result<ChunkRef, ChunkFailure> {
        let id = chunk_id(hash, index);
        let expected = data.len() as u64;
        let failure = |reason: String| ChunkFailure {
            index,
            chunk_id: id.clone(),
            node_id: node.id,
            reason,
        };

        match self.client.write_chunk(node.address, &id, data).await {
            Ok(size) if size == expected => {
                self.metrics.chunk_written(size);
                debug!("Chunk {} placed on node {}", id, node.id);
                Ok(ChunkRef {
                    chunk_id: id.clone(),
                    node_id: node.id,
                    index,
                    size,
                })
            }
            Ok(size) => {
                self.metrics.chunk_failed();
                Err(failure(format!(
                    "node recorded {} bytes, sent {}",
                    size, expected
                )))
            }
            Err(e) => {
                self.metrics.chunk_failed();
                Err(failure(e.to_string()))
            }
        }
    }

    /// Reassemble a file; fails closed if any chunk is unavailable
    pub async fn retrieve(&self, hash: &str) -> Result<(Bytes, String)> {
        let retrieved = self.retrieve_with(hash, RetrievalMode::Strict).await?;
        Ok((retrieved.data, retrieved.filename))
    }

    pub async fn retrieve_with(&self, hash: &str, mode: RetrievalMode) -> Result<Retrieved> {
        let record = self
            .catalog
            .get(hash)
            .await
            .ok_or_else(|| CloudError::NotFound(hash.to_string()))?;

        let ordered = record.chunks_in_order();
        let total = ordered.len();

        let mut missing: Vec<ChunkFailure> = record
            .missing_indices()
            .into_iter()
            .map(|index| ChunkFailure {
                index,
                chunk_id: chunk_id(hash, index),
                node_id: 0,
                reason: "no chunk recorded at this index".to_string(),
            })
            .collect();

        let fetched: Vec<std::result::Result<Bytes, ChunkFailure>> = stream::iter(ordered)
            .map(|chunk| self.fetch_chunk(chunk))
            .buffered(self.config.max_inflight)
            .collect()
            .await;

        let mut data = BytesMut::with_capacity(record.size as usize);
        for result in fetched {
            match result {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(failure) => missing.push(failure),
            }
        }
        missing.sort_by_key(|failure| failure.index);
        let data = data.freeze();

        if !missing.is_empty() {
            for failure in &missing {
                warn!("Retrieval gap: {}", failure);
            }
            if mode == RetrievalMode::Strict {
                return Err(CloudError::Incomplete {
                    hash: hash.to_string(),
                    total,
                    missing,
                });
            }
        } else {
            let actual = content_hash(&data);
            if actual != record.content_hash {
                return Err(CloudError::IntegrityMismatch {
                    expected: record.content_hash,
                    actual,
                });
            }
        }

        self.metrics.file_retrieved();
        info!(
            "Retrieved {} ({} bytes, {} chunks missing)",
            record.filename,
            data.len(),
            missing.len()
        );
        Ok(Retrieved {
            data,
            filename: record.filename,
            missing,
        })
    }

    async fn fetch_chunk(&self, chunk: ChunkRef) -> std::result::Result<Bytes, ChunkFailure> {
        let failure = |reason: String| ChunkFailure {
            index: chunk.index,
            chunk_id: chunk.chunk_id.clone(),
            node_id: chunk.node_id,
            reason,
        };

        // Resolve against the live registry, not the placement-time snapshot
        let node = match self.registry().get(chunk.node_id).await {
            Some(node) => node,
            None => {
                self.metrics.chunk_failed();
                return Err(failure("node is offline".to_string()));
            }
        };

        match self.client.read_chunk(node.address, &chunk.chunk_id).await {
            Ok(data) if data.len() as u64 == chunk.size => {
                self.metrics.chunk_read(chunk.size);
                Ok(data)
            }
            Ok(data) => {
                self.metrics.chunk_failed();
                Err(failure(format!(
                    "node returned {} bytes, expected {}",
                    data.len(),
                    chunk.size
                )))
            }
            Err(e) => {
                self.metrics.chunk_failed();
                Err(failure(e.to_string()))
            }
        }
    }

    /// Register a node and send it its partition
    pub async fn register_node(
        &self,
        id: NodeId,
        address: SocketAddr,
    ) -> Result<PartitionAssignment> {
        Ok(self.membership.register(id, address).await?)
    }

    /// Every node that is registered or supervised, in id order
    pub async fn list_nodes(&self) -> Vec<NodeView> {
        let layout = self.membership.layout();
        let mut views: BTreeMap<NodeId, NodeView> = BTreeMap::new();

        for id in self.managed.read().await.iter().copied() {
            if let Ok(partition) = layout.assignment(id) {
                views.insert(
                    id,
                    NodeView {
                        id,
                        address: None,
                        partition,
                        online: false,
                    },
                );
            }
        }
        for node in self.registry().snapshot().await {
            views.insert(
                node.id,
                NodeView {
                    id: node.id,
                    address: Some(node.address),
                    partition: node.partition,
                    online: true,
                },
            );
        }

        views.into_values().collect()
    }

    /// Ask the supervisor to start node `id`; it joins once it announces itself
    pub async fn start_node(&self, id: NodeId) -> Result<()> {
        self.membership.layout().assignment(id)?;
        self.supervisor.start(id)?;
        self.managed.write().await.insert(id);
        info!("Requested start of node {}", id);
        Ok(())
    }

    /// Ask the supervisor to stop node `id` and take it out of placement
    pub async fn stop_node(&self, id: NodeId) -> Result<()> {
        self.supervisor.stop(id)?;
        self.membership.remove(id).await;
        info!("Requested stop of node {}", id);
        Ok(())
    }

    /// Start the lowest ordinal that is neither registered nor supervised
    pub async fn add_node(&self) -> Result<NodeId> {
        let online: BTreeSet<NodeId> = self.registry().online_ids().await.into_iter().collect();
        let free = {
            let managed = self.managed.read().await;
            self.membership
                .layout()
                .ordinals()
                .find(|id| !online.contains(id) && !managed.contains(id))
        };
        let id = free.ok_or(RegistryError::NoFreeSlot(
            self.membership.layout().node_count(),
        ))?;
        self.start_node(id).await?;
        Ok(id)
    }

    /// Stop (if supervised) and forget node `id`
    pub async fn remove_node(&self, id: NodeId) -> Result<()> {
        let was_managed = self.managed.write().await.remove(&id);
        if was_managed {
            self.supervisor.stop(id)?;
        }
        let was_registered = self.membership.remove(id).await.is_some();
        if !was_managed && !was_registered {
            return Err(RegistryError::UnknownNode(id).into());
        }
        Ok(())
    }

    /// Per-node usage derived from the catalog
    pub async fn admin_stats(&self) -> AdminStats {
        let records = self.catalog.records().await;
        let mut usage: BTreeMap<NodeId, (u64, usize)> = BTreeMap::new();
        for chunk in records.iter().flat_map(|record| record.chunks.iter()) {
            let entry = usage.entry(chunk.node_id).or_default();
            entry.0 += chunk.size;
            entry.1 += 1;
        }

        let nodes: Vec<NodeStats> = self
            .list_nodes()
            .await
            .into_iter()
            .map(|view| {
                let (used_bytes, chunk_count) = usage.get(&view.id).copied().unwrap_or_default();
                NodeStats {
                    id: view.id,
                    online: view.online,
                    address: view.address,
                    partition: view.partition,
                    used_bytes,
                    chunk_count,
                    supervised: self.supervisor.is_alive(view.id),
                }
            })
            .collect();

        AdminStats {
            total_storage: self.config.total_disk_size,
            used_storage: usage.values().map(|(bytes, _)| bytes).sum(),
            file_count: records.len(),
            nodes,
        }
    }

    /// Chunks placed on node `id`, ordered by file then index
    pub async fn node_chunks(&self, id: NodeId) -> Vec<NodeChunk> {
        let mut chunks: Vec<NodeChunk> = self
            .catalog
            .records()
            .await
            .into_iter()
            .flat_map(|record| {
                record
                    .chunks_in_order()
                    .into_iter()
                    .filter(|chunk| chunk.node_id == id)
                    .map(|chunk| NodeChunk {
                        filename: record.filename.clone(),
                        chunk_id: chunk.chunk_id,
                        index: chunk.index,
                        size: chunk.size,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        chunks.sort_by(|a, b| a.filename.cmp(&b.filename).then(a.index.cmp(&b.index)));
        chunks
    }

    pub async fn prometheus(&self) -> String {
        self.metrics
            .to_prometheus(self.registry().len().await, self.catalog.len().await)
    }
}
