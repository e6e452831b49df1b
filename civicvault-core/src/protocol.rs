//! Control channel and discovery wire formats
//!
//! Every control message is one frame: a 4-byte big-endian length followed by
//! a tagged binary body. Chunk payloads travel as raw bytes.
//!
//! ```text
//! ASSIGN_PARTITION  0x01 | offset u64 | size u64
//! WRITE             0x02 | id_len u16 | chunk_id | data_len u32 | data
//! READ              0x03 | id_len u16 | chunk_id
//!
//! STORED            0x81 | size u64
//! DATA              0x82 | data_len u32 | data
//! ERROR             0x8f | code u8 | msg_len u16 | message
//! ```
//!
//! ASSIGN_PARTITION has no success reply: the node closes the connection
//! once the partition is applied, or sends an ERROR frame first if it refuses.
//!
//! Discovery beacons are single JSON datagrams such as
//! `{"type":"join","id":1,"port":40123}`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest chunk id accepted on the wire
pub const MAX_CHUNK_ID_LEN: usize = 256;

/// Bytes a WRITE frame carries on top of the chunk itself
pub const FRAME_OVERHEAD: usize = 1 + 2 + MAX_CHUNK_ID_LEN + 4;

/// Largest datagram the discovery listener reads
pub const MAX_BEACON_LEN: usize = 1024;

const TAG_ASSIGN_PARTITION: u8 = 0x01;
const TAG_WRITE: u8 = 0x02;
const TAG_READ: u8 = 0x03;
const TAG_STORED: u8 = 0x81;
const TAG_DATA: u8 = 0x82;
const TAG_ERROR: u8 = 0x8f;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("Unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Trailing {0} bytes after message")]
    TrailingBytes(usize),

    #[error("Invalid chunk id: {0}")]
    InvalidChunkId(String),

    #[error("Unknown error code {0}")]
    UnknownErrorCode(u8),

    #[error("Invalid beacon: {0}")]
    InvalidBeacon(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A node's window into the shared backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionAssignment {
    /// Absolute start of the partition in the backing file
    pub offset: u64,
    /// Length of the partition in bytes
    pub size: u64,
}

impl PartitionAssignment {
    /// Absolute end (exclusive) of the partition
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &PartitionAssignment) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Discovery datagram sent by a node to the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Beacon {
    Join { id: u32, port: u16 },
}

impl Beacon {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(datagram)?)
    }
}

/// Requests sent from the manager to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// No reply is sent
    AssignPartition(PartitionAssignment),
    Write { chunk_id: String, data: Bytes },
    Read { chunk_id: String },
}

/// Failure classes a node reports back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    NotProvisioned = 1,
    ChunkNotFound = 2,
    PartitionFull = 3,
    ChunkExists = 4,
    PartitionConflict = 5,
    BadRequest = 6,
    Internal = 7,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => ErrorCode::NotProvisioned,
            2 => ErrorCode::ChunkNotFound,
            3 => ErrorCode::PartitionFull,
            4 => ErrorCode::ChunkExists,
            5 => ErrorCode::PartitionConflict,
            6 => ErrorCode::BadRequest,
            7 => ErrorCode::Internal,
            other => return Err(ProtocolError::UnknownErrorCode(other)),
        })
    }
}

/// Replies sent from a node to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// WRITE accepted; carries the number of bytes recorded
    Stored { size: u64 },
    /// READ result
    Data(Bytes),
    Error { code: ErrorCode, message: String },
}

impl Reply {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Reply::Error {
            code,
            message: message.into(),
        }
    }
}

impl Command {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Command::AssignPartition(assignment) => {
                buf.reserve(17);
                buf.put_u8(TAG_ASSIGN_PARTITION);
                buf.put_u64(assignment.offset);
                buf.put_u64(assignment.size);
            }
            Command::Write { chunk_id, data } => {
                buf.reserve(1 + 2 + chunk_id.len() + 4 + data.len());
                buf.put_u8(TAG_WRITE);
                put_chunk_id(&mut buf, chunk_id)?;
                put_blob(&mut buf, data)?;
            }
            Command::Read { chunk_id } => {
                buf.reserve(1 + 2 + chunk_id.len());
                buf.put_u8(TAG_READ);
                put_chunk_id(&mut buf, chunk_id)?;
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let tag = take_u8(&mut body)?;
        let command = match tag {
            TAG_ASSIGN_PARTITION => {
                ensure(&body, 16)?;
                Command::AssignPartition(PartitionAssignment {
                    offset: body.get_u64(),
                    size: body.get_u64(),
                })
            }
            TAG_WRITE => {
                let chunk_id = take_chunk_id(&mut body)?;
                let data = take_blob(&mut body)?;
                Command::Write { chunk_id, data }
            }
            TAG_READ => Command::Read {
                chunk_id: take_chunk_id(&mut body)?,
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        finish(&body)?;
        Ok(command)
    }
}

impl Reply {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Reply::Stored { size } => {
                buf.put_u8(TAG_STORED);
                buf.put_u64(*size);
            }
            Reply::Data(data) => {
                buf.reserve(1 + 4 + data.len());
                buf.put_u8(TAG_DATA);
                put_blob(&mut buf, data)?;
            }
            Reply::Error { code, message } => {
                // Messages are diagnostics only; cut at a char boundary to fit u16
                let mut end = message.len().min(u16::MAX as usize);
                while !message.is_char_boundary(end) {
                    end -= 1;
                }
                buf.put_u8(TAG_ERROR);
                buf.put_u8(*code as u8);
                buf.put_u16(end as u16);
                buf.put_slice(&message.as_bytes()[..end]);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let tag = take_u8(&mut body)?;
        let reply = match tag {
            TAG_STORED => {
                ensure(&body, 8)?;
                Reply::Stored {
                    size: body.get_u64(),
                }
            }
            TAG_DATA => Reply::Data(take_blob(&mut body)?),
            TAG_ERROR => {
                let code = ErrorCode::try_from(take_u8(&mut body)?)?;
                ensure(&body, 2)?;
                let len = body.get_u16() as usize;
                ensure(&body, len)?;
                let message = String::from_utf8_lossy(&body.split_to(len)).into_owned();
                Reply::Error { code, message }
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        finish(&body)?;
        Ok(reply)
    }
}

/// Read one length-prefixed frame, refusing bodies larger than `limit`
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > limit {
        return Err(ProtocolError::FrameTooLarge { len, limit });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: body.len(),
        limit: u32::MAX as usize,
    })?;
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(len);
    frame.put_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn validate_chunk_id(chunk_id: &str) -> Result<()> {
    if chunk_id.is_empty() {
        return Err(ProtocolError::InvalidChunkId("empty".to_string()));
    }
    if chunk_id.len() > MAX_CHUNK_ID_LEN {
        return Err(ProtocolError::InvalidChunkId(format!(
            "{} bytes exceeds {}",
            chunk_id.len(),
            MAX_CHUNK_ID_LEN
        )));
    }
    Ok(())
}

fn put_chunk_id(buf: &mut BytesMut, chunk_id: &str) -> Result<()> {
    validate_chunk_id(chunk_id)?;
    buf.put_u16(chunk_id.len() as u16);
    buf.put_slice(chunk_id.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: data.len(),
        limit: u32::MAX as usize,
    })?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

fn ensure(body: &Bytes, needed: usize) -> Result<()> {
    if body.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: body.remaining(),
        });
    }
    Ok(())
}

fn finish(body: &Bytes) -> Result<()> {
    match body.remaining() {
        0 => Ok(()),
        extra => Err(ProtocolError::TrailingBytes(extra)),
    }
}

fn take_u8(body: &mut Bytes) -> Result<u8> {
    ensure(body, 1)?;
    Ok(body.get_u8())
}

fn take_chunk_id(body: &mut Bytes) -> Result<String> {
    ensure(body, 2)?;
    let len = body.get_u16() as usize;
    ensure(body, len)?;
    let raw = body.split_to(len);
    let chunk_id = String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::InvalidChunkId("not valid UTF-8".to_string()))?;
    validate_chunk_id(&chunk_id)?;
    Ok(chunk_id)
}

fn take_blob(body: &mut Bytes) -> Result<Bytes> {
    ensure(body, 4)?;
    let len = body.get_u32() as usize;
    ensure(body, len)?;
    Ok(body.split_to(len))
}
