//! Node discovery and registration
//!
//! Nodes announce themselves with a fire-and-forget UDP join beacon. The
//! listener turns each beacon into a registration: the node's partition is
//! computed from its ordinal, delivered over the control channel, and only
//! then is the node entered into the registry and made eligible for
//! placement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientError, NodeClient};
use crate::metrics::Metrics;
use crate::protocol::{Beacon, PartitionAssignment, MAX_BEACON_LEN};
use crate::registry::{NodeId, NodeInfo, PartitionLayout, Registry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to deliver partition assignment to node {id} at {address}: {source}")]
    Delivery {
        id: NodeId,
        address: SocketAddr,
        #[source]
        source: ClientError,
    },
}

/// Registration logic shared by the listener and admin callers
///
/// Every registration is stamped with a sequence number when it is
/// received. Registrations for the same id may finish out of order; one
/// that is older than the last applied for its id leaves the registry alone.
#[derive(Clone)]
pub struct Membership {
    registry: Registry,
    layout: PartitionLayout,
    client: NodeClient,
    metrics: Metrics,
    sequence: Arc<AtomicU64>,
    applied: Arc<Mutex<HashMap<NodeId, u64>>>,
}

impl Membership {
    pub fn new(
        registry: Registry,
        layout: PartitionLayout,
        client: NodeClient,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            layout,
            client,
            metrics,
            sequence: Arc::new(AtomicU64::new(0)),
            applied: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Register `id` at `address` and send it its partition
    ///
    /// Repeating a registration yields the same assignment. If the
    /// assignment cannot be delivered the registry is left untouched.
    pub async fn register(
        &self,
        id: NodeId,
        address: SocketAddr,
    ) -> Result<PartitionAssignment, MembershipError> {
        self.register_in_order(id, address, self.next_sequence()).await
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn register_in_order(
        &self,
        id: NodeId,
        address: SocketAddr,
        sequence: u64,
    ) -> Result<PartitionAssignment, MembershipError> {
        let partition = self.layout.assignment(id)?;

        if let Err(source) = self.client.assign_partition(address, partition).await {
            self.metrics.assignment_failed();
            return Err(MembershipError::Delivery {
                id,
                address,
                source,
            });
        }

        let mut applied = self.applied.lock().await;
        if applied.get(&id).is_some_and(|&last| last > sequence) {
            debug!("Node {}: ignoring stale registration at {}", id, address);
            return Ok(partition);
        }
        applied.insert(id, sequence);

        let previous = self
            .registry
            .upsert(NodeInfo {
                id,
                address,
                partition,
                online: true,
            })
            .await;
        drop(applied);
        self.metrics.node_registered();

        match previous {
            None => info!(
                "Node {} registered at {} (offset {}, size {})",
                id, address, partition.offset, partition.size
            ),
            Some(old) if old.address != address => {
                info!("Node {} moved from {} to {}", id, old.address, address)
            }
            Some(_) => debug!("Node {} re-registered at {}", id, address),
        }

        Ok(partition)
    }

    /// Drop `id` from the registry; returns its last entry
    pub async fn remove(&self, id: NodeId) -> Option<NodeInfo> {
        let removed = self.registry.remove(id).await;
        if removed.is_some() {
            info!("Node {} removed from registry", id);
        }
        removed
    }
}

/// UDP listener for join beacons
pub struct DiscoveryListener {
    socket: UdpSocket,
    membership: Membership,
}

impl DiscoveryListener {
    pub async fn bind(addr: SocketAddr, membership: Membership) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Node monitor active on UDP {}", socket.local_addr()?);
        Ok(Self { socket, membership })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive beacons until the task is dropped
    ///
    /// Each registration runs on its own task so one unreachable node does
    /// not delay the others.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_BEACON_LEN];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Discovery receive failed: {}", e);
                    continue;
                }
            };

            let (id, port) = match Beacon::decode(&buf[..len]) {
                Ok(Beacon::Join { id, port }) => (id, port),
                Err(e) => {
                    warn!("Ignoring malformed beacon from {}: {}", from, e);
                    continue;
                }
            };

            let address = SocketAddr::new(from.ip(), port);
            debug!("Join beacon from node {} at {}", id, address);

            let membership = self.membership.clone();
            let sequence = membership.next_sequence();
            tokio::spawn(async move {
                if let Err(e) = membership.register_in_order(id, address, sequence).await {
                    warn!("Registration of node {} failed: {}", id, e);
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_frame, write_frame, Command, ErrorCode, Reply};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn membership(node_count: u32) -> Membership {
        Membership::new(
            Registry::new(),
            PartitionLayout::new(u64::from(node_count) * 1000, node_count).unwrap(),
            NodeClient::new(Duration::from_millis(500), 1024),
            Metrics::new(),
        )
    }

    /// Control endpoint that forwards every received command
    async fn fake_node() -> (SocketAddr, mpsc::UnboundedReceiver<Command>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let body = read_frame(&mut stream, 1024).await.unwrap();
                let _ = tx.send(Command::decode(body).unwrap());
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_register_delivers_assignment() {
        let membership = membership(3);
        let (addr, mut commands) = fake_node().await;

        let assignment = membership.register(2, addr).await.unwrap();

        assert_eq!(assignment.offset, 1000);
        assert_eq!(
            commands.recv().await.unwrap(),
            Command::AssignPartition(assignment)
        );
        let info = membership.registry().get(2).await.unwrap();
        assert_eq!(info.address, addr);
        assert!(info.online);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_idempotent() {
        let membership = membership(3);
        let (addr, _commands) = fake_node().await;

        let first = membership.register(3, addr).await.unwrap();
        let second = membership.register(3, addr).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(membership.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_undeliverable_assignment_leaves_registry_unchanged() {
        let membership = membership(3);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let err = membership.register(1, dead).await.unwrap_err();

        assert!(matches!(err, MembershipError::Delivery { id: 1, .. }));
        assert!(membership.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_out_of_range_id_rejected() {
        let membership = membership(2);
        let (addr, _commands) = fake_node().await;

        let err = membership.register(3, addr).await.unwrap_err();
        assert!(matches!(
            err,
            MembershipError::Registry(RegistryError::InvalidNodeId { id: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_older_registration_does_not_overwrite_newer() {
        let membership = membership(3);
        let (old_addr, _old) = fake_node().await;
        let (new_addr, _new) = fake_node().await;
        let older = membership.next_sequence();
        let newer = membership.next_sequence();

        membership
            .register_in_order(1, new_addr, newer)
            .await
            .unwrap();
        membership
            .register_in_order(1, old_addr, older)
            .await
            .unwrap();

        assert_eq!(membership.registry().get(1).await.unwrap().address, new_addr);

        membership.register(1, old_addr).await.unwrap();
        assert_eq!(membership.registry().get(1).await.unwrap().address, old_addr);
    }

    #[tokio::test]
    async fn test_refused_assignment_leaves_registry_unchanged() {
        let membership = membership(3);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream, 1024).await.unwrap();
            let refusal = Reply::error(ErrorCode::PartitionConflict, "partition already set");
            write_frame(&mut stream, &refusal.encode().unwrap())
                .await
                .unwrap();
        });

        let err = membership.register(2, addr).await.unwrap_err();

        assert!(matches!(err, MembershipError::Delivery { id: 2, .. }));
        assert!(!membership.registry().contains(2).await);
    }

    #[tokio::test]
    async fn test_beacon_registers_node() {
        let membership = membership(3);
        let registry = membership.registry().clone();
        let listener = DiscoveryListener::bind("127.0.0.1:0".parse().unwrap(), membership)
            .await
            .unwrap();
        let discovery = listener.local_addr().unwrap();
        let _task = listener.spawn();

        let (node_addr, mut commands) = fake_node().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", discovery).await.unwrap();
        let beacon = Beacon::Join {
            id: 1,
            port: node_addr.port(),
        };
        sender
            .send_to(&beacon.encode().unwrap(), discovery)
            .await
            .unwrap();

        let command = tokio::time::timeout(Duration::from_secs(5), commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(command, Command::AssignPartition(a) if a.offset == 0));

        for _ in 0..100 {
            if registry.contains(1).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.get(1).await.unwrap().address, node_addr);
    }
}
