//! Manager-side client for the node control channel
//!
//! One TCP connection per request. Every connect, read and write is bounded
//! by the configured I/O timeout; a timeout is reported like any other
//! network failure.

use bytes::Bytes;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::protocol::{
    read_frame, write_frame, Command, ErrorCode, PartitionAssignment, ProtocolError, Reply,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out talking to {0}")]
    Timeout(SocketAddr),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Node rejected request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ClientError {
    /// Node-side error code, when the node answered with one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct NodeClient {
    io_timeout: Duration,
    max_frame_len: usize,
}

impl NodeClient {
    pub fn new(io_timeout: Duration, max_frame_len: usize) -> Self {
        Self {
            io_timeout,
            max_frame_len,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.io_timeout(), config.max_frame_len)
    }

    async fn bounded<T, F>(&self, addr: SocketAddr, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, ProtocolError>>,
    {
        match timeout(self.io_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClientError::Timeout(addr)),
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        match timeout(self.io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ClientError::Connect { addr, source }),
            Err(_) => Err(ClientError::Timeout(addr)),
        }
    }

    async fn send(&self, stream: &mut TcpStream, addr: SocketAddr, command: &Command) -> Result<()> {
        let body = command.encode()?;
        self.bounded(addr, write_frame(stream, &body)).await
    }

    async fn request(&self, addr: SocketAddr, command: &Command) -> Result<Reply> {
        let mut stream = self.connect(addr).await?;
        self.send(&mut stream, addr, command).await?;
        let body = self
            .bounded(addr, read_frame(&mut stream, self.max_frame_len))
            .await?;
        Ok(Reply::decode(body)?)
    }

    /// Send ASSIGN_PARTITION and wait for the node to apply it
    ///
    /// An accepted assignment gets no reply: the node closes the connection
    /// once the partition is applied. A refused one is answered with an
    /// ERROR frame before the close. Silence past the I/O timeout counts as
    /// a failure.
    pub async fn assign_partition(
        &self,
        addr: SocketAddr,
        assignment: PartitionAssignment,
    ) -> Result<()> {
        let mut stream = self.connect(addr).await?;
        self.send(&mut stream, addr, &Command::AssignPartition(assignment))
            .await?;

        let answer = timeout(self.io_timeout, read_frame(&mut stream, self.max_frame_len)).await;
        let body = match answer {
            Err(_) => return Err(ClientError::Timeout(addr)),
            Ok(Err(ProtocolError::Io(e))) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Node at {} applied partition {:?}", addr, assignment);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(body)) => body,
        };

        match Reply::decode(body)? {
            Reply::Error { code, message } => Err(ClientError::Rejected { code, message }),
            other => Err(ClientError::UnexpectedReply(format!(
                "{:?} in response to ASSIGN_PARTITION",
                other
            ))),
        }
    }

    /// Store a chunk; returns the size the node recorded
    pub async fn write_chunk(&self, addr: SocketAddr, chunk_id: &str, data: Bytes) -> Result<u64> {
        let command = Command::Write {
            chunk_id: chunk_id.to_string(),
            data,
        };
        match self.request(addr, &command).await? {
            Reply::Stored { size } => Ok(size),
            Reply::Error { code, message } => Err(ClientError::Rejected { code, message }),
            Reply::Data(_) => Err(ClientError::UnexpectedReply(
                "DATA in response to WRITE".to_string(),
            )),
        }
    }

    pub async fn read_chunk(&self, addr: SocketAddr, chunk_id: &str) -> Result<Bytes> {
        let command = Command::Read {
            chunk_id: chunk_id.to_string(),
        };
        match self.request(addr, &command).await? {
            Reply::Data(data) => Ok(data),
            Reply::Error { code, message } => Err(ClientError::Rejected { code, message }),
            Reply::Stored { .. } => Err(ClientError::UnexpectedReply(
                "STORED in response to READ".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn client() -> NodeClient {
        NodeClient::new(Duration::from_millis(500), 1024 * 1024)
    }

    /// Accept one connection, decode its command and answer with `reply`
    async fn one_shot_node(reply: Option<Reply>) -> (SocketAddr, tokio::task::JoinHandle<Command>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let body = read_frame(&mut stream, 1024 * 1024).await.unwrap();
            let command = Command::decode(body).unwrap();
            if let Some(reply) = reply {
                write_frame(&mut stream, &reply.encode().unwrap())
                    .await
                    .unwrap();
            }
            command
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_write_chunk_returns_recorded_size() {
        let (addr, node) = one_shot_node(Some(Reply::Stored { size: 3 })).await;

        let size = client()
            .write_chunk(addr, "h_0", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert_eq!(size, 3);
        assert_eq!(
            node.await.unwrap(),
            Command::Write {
                chunk_id: "h_0".to_string(),
                data: Bytes::from_static(b"abc"),
            }
        );
    }

    #[tokio::test]
    async fn test_rejection_carries_error_code() {
        let (addr, _node) =
            one_shot_node(Some(Reply::error(ErrorCode::ChunkNotFound, "missing"))).await;

        let err = client().read_chunk(addr, "h_9").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ChunkNotFound));
    }

    #[tokio::test]
    async fn test_assign_partition_waits_for_close() {
        let (addr, node) = one_shot_node(None).await;
        let assignment = PartitionAssignment {
            offset: 2048,
            size: 1024,
        };

        client().assign_partition(addr, assignment).await.unwrap();
        assert_eq!(
            node.await.unwrap(),
            Command::AssignPartition(assignment)
        );
    }

    #[tokio::test]
    async fn test_refused_assignment_is_rejection() {
        let (addr, _node) = one_shot_node(Some(Reply::error(
            ErrorCode::PartitionConflict,
            "already holds offset 0",
        )))
        .await;
        let assignment = PartitionAssignment {
            offset: 1024,
            size: 1024,
        };

        let err = client()
            .assign_partition(addr, assignment)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PartitionConflict));
    }

    #[tokio::test]
    async fn test_assignment_left_open_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream, 1024).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = NodeClient::new(Duration::from_millis(100), 1024);
        let assignment = PartitionAssignment { offset: 0, size: 1 };
        let err = client.assign_partition(addr, assignment).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(a) if a == addr));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client().read_chunk(addr, "h_0").await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = NodeClient::new(Duration::from_millis(100), 1024);
        let err = client.read_chunk(addr, "h_0").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(a) if a == addr));
    }
}
