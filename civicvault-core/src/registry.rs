//! Membership registry and partition layout
//!
//! The registry is the manager's view of which nodes are online, where they
//! listen and which partition each one owns. A node is online exactly while
//! it has an entry here; there is no heartbeat or liveness probe.
//!
//! Partition assignment is a pure function of the node ordinal, so duplicate
//! or late beacons always land on the same slot.

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::protocol::PartitionAssignment;

/// Stable node ordinal, starting at 1
pub type NodeId = u32;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Node id {id} is outside 1..={node_count}")]
    InvalidNodeId { id: NodeId, node_count: u32 },

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("All {0} node slots are in use")]
    NoFreeSlot(u32),

    #[error("Cannot lay out {total_size} bytes over {node_count} nodes")]
    InvalidLayout { total_size: u64, node_count: u32 },
}

/// Static slicing of the backing file into equal, contiguous partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    node_count: u32,
    partition_size: u64,
}

impl PartitionLayout {
    pub fn new(total_size: u64, node_count: u32) -> Result<Self, RegistryError> {
        if node_count == 0 || total_size < u64::from(node_count) {
            return Err(RegistryError::InvalidLayout {
                total_size,
                node_count,
            });
        }
        Ok(Self {
            node_count,
            partition_size: total_size / u64::from(node_count),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        Self::new(config.total_disk_size, config.node_count)
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    /// Valid node ordinals
    pub fn ordinals(&self) -> RangeInclusive<NodeId> {
        1..=self.node_count
    }

    /// Partition owned by `id`: offset `(id - 1) * partition_size`
    pub fn assignment(&self, id: NodeId) -> Result<PartitionAssignment, RegistryError> {
        if !self.ordinals().contains(&id) {
            return Err(RegistryError::InvalidNodeId {
                id,
                node_count: self.node_count,
            });
        }
        Ok(PartitionAssignment {
            offset: u64::from(id - 1) * self.partition_size,
            size: self.partition_size,
        })
    }
}

/// A registered node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: SocketAddr,
    pub partition: PartitionAssignment,
    pub online: bool,
}

/// Shared registry of online nodes, ordered by node id
#[derive(Debug, Clone, Default)]
pub struct Registry {
    nodes: Arc<RwLock<BTreeMap<NodeId, NodeInfo>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node; the last registration wins
    pub async fn upsert(&self, info: NodeInfo) -> Option<NodeInfo> {
        self.nodes.write().await.insert(info.id, info)
    }

    pub async fn remove(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.write().await.remove(&id)
    }

    pub async fn get(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().await.contains_key(&id)
    }

    /// Point-in-time copy of every online node in ascending id order
    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn online_ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, port: u16, layout: &PartitionLayout) -> NodeInfo {
        NodeInfo {
            id,
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            partition: layout.assignment(id).unwrap(),
            online: true,
        }
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let layout = PartitionLayout::new(300, 3).unwrap();

        for _ in 0..3 {
            for id in [3, 1, 2, 2] {
                let assignment = layout.assignment(id).unwrap();
                assert_eq!(assignment.offset, u64::from(id - 1) * 100);
                assert_eq!(assignment.size, 100);
            }
        }
    }

    #[test]
    fn test_partitions_are_disjoint_and_inside_disk() {
        let total = 1000;
        let layout = PartitionLayout::new(total, 7).unwrap();
        let partitions: Vec<_> = layout
            .ordinals()
            .map(|id| layout.assignment(id).unwrap())
            .collect();

        for (i, a) in partitions.iter().enumerate() {
            assert!(a.end() <= total);
            for b in &partitions[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn test_out_of_range_ids_rejected() {
        let layout = PartitionLayout::new(300, 3).unwrap();
        assert!(matches!(
            layout.assignment(0),
            Err(RegistryError::InvalidNodeId { id: 0, .. })
        ));
        assert!(layout.assignment(4).is_err());
    }

    #[test]
    fn test_invalid_layout() {
        assert!(PartitionLayout::new(100, 0).is_err());
        assert!(PartitionLayout::new(2, 3).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_sorted_by_id() {
        let layout = PartitionLayout::new(300, 3).unwrap();
        let registry = Registry::new();

        registry.upsert(node(3, 9003, &layout)).await;
        registry.upsert(node(1, 9001, &layout)).await;
        registry.upsert(node(2, 9002, &layout)).await;

        assert_eq!(registry.online_ids().await, vec![1, 2, 3]);
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].address.port(), 9001);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let layout = PartitionLayout::new(300, 3).unwrap();
        let registry = Registry::new();

        assert!(registry.upsert(node(2, 9002, &layout)).await.is_none());
        let previous = registry.upsert(node(2, 9102, &layout)).await.unwrap();

        assert_eq!(previous.address.port(), 9002);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(2).await.unwrap().address.port(), 9102);
    }

    #[tokio::test]
    async fn test_remove() {
        let layout = PartitionLayout::new(300, 3).unwrap();
        let registry = Registry::new();
        registry.upsert(node(1, 9001, &layout)).await;

        assert!(registry.remove(1).await.is_some());
        assert!(registry.remove(1).await.is_none());
        assert!(registry.is_empty().await);
        assert!(!registry.contains(1).await);
    }
}
