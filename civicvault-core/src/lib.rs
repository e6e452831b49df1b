//! CivicVault Core
//!
//! Chunk distribution, node membership and partitioned node-side storage.

pub mod catalog;
pub mod chunker;
pub mod client;
pub mod config;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod supervisor;

pub use catalog::{CatalogError, ChunkRef, FileCatalog, FileRecord};
pub use chunker::{chunk_id, content_hash, Chunker, DEFAULT_CHUNK_SIZE};
pub use client::{ClientError, NodeClient};
pub use config::{Action, Config, ConfigError};
pub use listener::{DiscoveryListener, Membership, MembershipError};
pub use manager::{
    AdminStats, ChunkFailure, CloudError, CloudManager, NodeChunk, NodeStats, NodeView,
    RetrievalMode, Retrieved,
};
pub use metrics::Metrics;
pub use node::{NodeError, StorageNode};
pub use protocol::{Beacon, Command, ErrorCode, PartitionAssignment, ProtocolError, Reply};
pub use registry::{NodeId, NodeInfo, PartitionLayout, Registry, RegistryError};
pub use runtime::{run, run_manager, run_node, RuntimeError};
pub use storage::{ensure_backing_file, FatEntry, PartitionStats, PartitionStore, StorageError};
pub use supervisor::{ManualSupervisor, NodeSupervisor, SupervisorError};
