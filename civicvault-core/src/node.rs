//! Storage node runtime
//!
//! Binds the control endpoint, announces it to the manager's discovery
//! endpoint, and serves ASSIGN_PARTITION / WRITE / READ frames against the
//! local [`PartitionStore`]. Each connection carries one request and is
//! handled on its own task; the store serializes them.

use std::future::Future;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::protocol::{read_frame, write_frame, Beacon, Command, ProtocolError, Reply};
use crate::registry::NodeId;
use crate::storage::{ensure_backing_file, PartitionStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Node id {id} is outside 1..={node_count}")]
    InvalidId { id: NodeId, node_count: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out")]
    Timeout,
}

struct NodeContext {
    id: NodeId,
    store: Arc<PartitionStore>,
    metrics: Metrics,
    io_timeout: Duration,
    max_frame_len: usize,
}

pub struct StorageNode {
    id: NodeId,
    listener: TcpListener,
    store: Arc<PartitionStore>,
    metrics: Metrics,
    discovery_addr: SocketAddr,
    announce_interval: Option<Duration>,
    io_timeout: Duration,
    max_frame_len: usize,
}

impl StorageNode {
    /// Open the node's store and bind its control endpoint
    pub async fn bind(config: &Config, id: NodeId) -> Result<Self, NodeError> {
        if id == 0 || id > config.node_count {
            return Err(NodeError::InvalidId {
                id,
                node_count: config.node_count,
            });
        }

        std::fs::create_dir_all(&config.data_dir)?;
        let disk_path = config.disk_path();
        ensure_backing_file(&disk_path, config.total_disk_size)?;
        let store = PartitionStore::open(&disk_path, config.index_path(id))?;

        let listener = TcpListener::bind(config.node_bind_addr).await?;
        info!("Node {} ONLINE on {}", id, listener.local_addr()?);

        Ok(Self {
            id,
            listener,
            store: Arc::new(store),
            metrics: Metrics::new(),
            discovery_addr: config.discovery_addr,
            announce_interval: config.announce_interval(),
            io_timeout: config.io_timeout(),
            max_frame_len: config.max_frame_len,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> Arc<PartitionStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    fn beacon(&self) -> Result<Vec<u8>, NodeError> {
        let port = self.local_addr()?.port();
        Ok(Beacon::Join { id: self.id, port }.encode()?)
    }

    /// Send one join beacon to the discovery endpoint
    pub async fn announce(&self) -> Result<(), NodeError> {
        send_beacon(self.discovery_addr, &self.beacon()?).await?;
        Ok(())
    }

    fn spawn_announcer(&self) -> Result<JoinHandle<()>, NodeError> {
        let beacon = self.beacon()?;
        let discovery = self.discovery_addr;
        let interval = self.announce_interval;
        let id = self.id;

        Ok(tokio::spawn(async move {
            loop {
                match send_beacon(discovery, &beacon).await {
                    Ok(()) => debug!("Node {} announced to {}", id, discovery),
                    Err(e) => warn!("Node {} failed to announce to {}: {}", id, discovery, e),
                }
                match interval {
                    Some(every) => tokio::time::sleep(every).await,
                    None => break,
                }
            }
        }))
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        let announcer = self.spawn_announcer()?;
        let ctx = Arc::new(NodeContext {
            id: self.id,
            store: Arc::clone(&self.store),
            metrics: self.metrics.clone(),
            io_timeout: self.io_timeout,
            max_frame_len: self.max_frame_len,
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &ctx).await {
                                ctx.metrics.request_failed();
                                warn!("Node {}: dropped request from {}: {}", ctx.id, peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Node {}: accept failed: {}", self.id, e),
                },
                _ = &mut shutdown => break,
            }
        }

        announcer.abort();
        info!("Node {} stopped", self.id);
        Ok(())
    }

    pub async fn run(self) -> Result<(), NodeError> {
        self.run_until(std::future::pending()).await
    }
}

async fn send_beacon(discovery: SocketAddr, beacon: &[u8]) -> std::io::Result<()> {
    let local: SocketAddr = if discovery.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket.send_to(beacon, discovery).await?;
    Ok(())
}

async fn run_blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))?
}

async fn handle_connection(mut stream: TcpStream, ctx: &NodeContext) -> Result<(), NodeError> {
    let body = timeout(ctx.io_timeout, read_frame(&mut stream, ctx.max_frame_len))
        .await
        .map_err(|_| NodeError::Timeout)??;

    let reply = match Command::decode(body)? {
        Command::AssignPartition(assignment) => {
            let store = Arc::clone(&ctx.store);
            match run_blocking(move || store.assign(assignment)).await {
                // Accepted assignments are acknowledged by closing
                Ok(_) => return Ok(()),
                Err(e) => {
                    ctx.metrics.request_failed();
                    warn!("Node {}: assignment {:?} refused: {}", ctx.id, assignment, e);
                    Reply::error(e.code(), e.to_string())
                }
            }
        }
        Command::Write { chunk_id, data } => {
            let store = Arc::clone(&ctx.store);
            let id = chunk_id.clone();
            match run_blocking(move || store.write(&id, &data)).await {
                Ok(size) => {
                    ctx.metrics.chunk_written(size);
                    Reply::Stored { size }
                }
                Err(e) => {
                    ctx.metrics.request_failed();
                    warn!("Node {}: write of {} rejected: {}", ctx.id, chunk_id, e);
                    Reply::error(e.code(), e.to_string())
                }
            }
        }
        Command::Read { chunk_id } => {
            let store = Arc::clone(&ctx.store);
            let id = chunk_id.clone();
            match run_blocking(move || store.read(&id)).await {
                Ok(data) => {
                    ctx.metrics.chunk_read(data.len() as u64);
                    Reply::Data(data.into())
                }
                Err(e) => {
                    ctx.metrics.request_failed();
                    warn!("Node {}: read of {} rejected: {}", ctx.id, chunk_id, e);
                    Reply::error(e.code(), e.to_string())
                }
            }
        }
    };

    let encoded = reply.encode()?;
    timeout(ctx.io_timeout, write_frame(&mut stream, &encoded))
        .await
        .map_err(|_| NodeError::Timeout)??;
    Ok(())
}
