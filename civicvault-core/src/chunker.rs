//! Fixed-size chunking and content addressing for file payloads

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Default chunk size: 2 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Hex SHA-256 of the full payload; doubles as the retrieval handle
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Globally unique id of chunk `index` of the file with `content_hash`
pub fn chunk_id(content_hash: &str, index: usize) -> String {
    format!("{}_{}", content_hash, index)
}

/// Splits payloads into fixed-size chunks; the last one may be shorter
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks a payload of `len` bytes produces
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Split without copying; every chunk shares the payload's buffer
    pub fn split(&self, payload: &Bytes) -> Vec<Bytes> {
        (0..payload.len())
            .step_by(self.chunk_size)
            .map(|start| payload.slice(start..(start + self.chunk_size).min(payload.len())))
            .collect()
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_hello_world_with_5_byte_chunks() {
        let chunker = Chunker::new(5);
        let chunks = chunker.split(&Bytes::from_static(b"hello world"));

        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"hello"),
                Bytes::from_static(b" worl"),
                Bytes::from_static(b"d"),
            ]
        );
    }

    #[test]
    fn test_exact_chunk_size_boundaries() {
        let chunker = Chunker::new(5);
        let chunks = chunker.split(&Bytes::from_static(b"0123456789"));

        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[1][..], b"56789");
    }

    #[test]
    fn test_empty_input() {
        let chunker = Chunker::new(64);
        assert!(chunker.split(&Bytes::new()).is_empty());
        assert_eq!(chunker.chunk_count(0), 0);
    }

    #[test]
    fn test_chunk_count_and_last_chunk_length() {
        let chunk_size = 16;
        let chunker = Chunker::new(chunk_size);

        for len in 0..=5 * chunk_size {
            let payload = Bytes::from(vec![7u8; len]);
            let chunks = chunker.split(&payload);

            assert_eq!(chunks.len(), len.div_ceil(chunk_size), "len {}", len);
            assert_eq!(chunks.len(), chunker.chunk_count(len));
            if let Some(last) = chunks.last() {
                let expected = match len % chunk_size {
                    0 => chunk_size,
                    rem => rem,
                };
                assert_eq!(last.len(), expected, "len {}", len);
            }
            assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), len);
        }
    }

    #[test]
    fn test_large_data_1mb_with_64kb_chunks() {
        let data: Vec<u8> = (0..1024 * 1024).map(|i| (i % 256) as u8).collect();
        let payload = Bytes::from(data.clone());
        let chunks = Chunker::new(64 * 1024).split(&payload);

        assert_eq!(chunks.len(), 16);
        let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(rejoined, data);
    }

    #[test]
    #[should_panic(expected = "chunk_size must be greater than 0")]
    fn test_zero_chunk_size_panics() {
        let _chunker = Chunker::new(0);
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash(b"hello").len(), 64);
        assert_ne!(content_hash(b"hello"), content_hash(b"hellp"));
    }

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id("abc", 0), "abc_0");
        assert_eq!(chunk_id("abc", 12), "abc_12");
    }
}
