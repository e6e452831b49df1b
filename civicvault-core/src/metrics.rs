//! Prometheus-style counters for managers and nodes
//!
//! Thread-safe metrics collection using atomic types

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Chunk traffic
    chunks_written: AtomicU64,
    bytes_written: AtomicU64,
    chunks_read: AtomicU64,
    bytes_read: AtomicU64,
    chunk_failures: AtomicU64,

    // File-level operations (manager side)
    files_stored: AtomicU64,
    files_retrieved: AtomicU64,

    // Membership
    registrations: AtomicU64,
    assignment_failures: AtomicU64,

    // Rejected or malformed control requests (node side)
    request_errors: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                chunks_written: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                chunks_read: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                chunk_failures: AtomicU64::new(0),
                files_stored: AtomicU64::new(0),
                files_retrieved: AtomicU64::new(0),
                registrations: AtomicU64::new(0),
                assignment_failures: AtomicU64::new(0),
                request_errors: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Chunk traffic

    pub fn chunk_written(&self, size: u64) {
        self.inner.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_written.fetch_add(size, Ordering::Relaxed);
    }

    pub fn chunk_read(&self, size: u64) {
        self.inner.chunks_read.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_read.fetch_add(size, Ordering::Relaxed);
    }

    pub fn chunk_failed(&self) {
        self.inner.chunk_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_written(&self) -> u64 {
        self.inner.chunks_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn chunks_read(&self) -> u64 {
        self.inner.chunks_read.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    pub fn chunk_failures(&self) -> u64 {
        self.inner.chunk_failures.load(Ordering::Relaxed)
    }

    // File operations

    pub fn file_stored(&self) {
        self.inner.files_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_retrieved(&self) {
        self.inner.files_retrieved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_stored(&self) -> u64 {
        self.inner.files_stored.load(Ordering::Relaxed)
    }

    pub fn files_retrieved(&self) -> u64 {
        self.inner.files_retrieved.load(Ordering::Relaxed)
    }

    // Membership

    pub fn node_registered(&self) {
        self.inner.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn assignment_failed(&self) {
        self.inner.assignment_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registrations(&self) -> u64 {
        self.inner.registrations.load(Ordering::Relaxed)
    }

    pub fn assignment_failures(&self) -> u64 {
        self.inner.assignment_failures.load(Ordering::Relaxed)
    }

    // Node requests

    pub fn request_failed(&self) {
        self.inner.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_errors(&self) -> u64 {
        self.inner.request_errors.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self, nodes_online: usize, file_count: usize) -> String {
        format!(
            "# HELP civicvault_nodes_online Nodes currently in the registry\n\
             # TYPE civicvault_nodes_online gauge\n\
             civicvault_nodes_online {}\n\
             \n\
             # HELP civicvault_files Files recorded in the catalog\n\
             # TYPE civicvault_files gauge\n\
             civicvault_files {}\n\
             \n\
             # HELP civicvault_uptime_seconds Time since start in seconds\n\
             # TYPE civicvault_uptime_seconds counter\n\
             civicvault_uptime_seconds {}\n\
             \n\
             # HELP civicvault_chunks_written_total Chunks written\n\
             # TYPE civicvault_chunks_written_total counter\n\
             civicvault_chunks_written_total {}\n\
             \n\
             # HELP civicvault_bytes_written_total Chunk bytes written\n\
             # TYPE civicvault_bytes_written_total counter\n\
             civicvault_bytes_written_total {}\n\
             \n\
             # HELP civicvault_chunks_read_total Chunks read\n\
             # TYPE civicvault_chunks_read_total counter\n\
             civicvault_chunks_read_total {}\n\
             \n\
             # HELP civicvault_bytes_read_total Chunk bytes read\n\
             # TYPE civicvault_bytes_read_total counter\n\
             civicvault_bytes_read_total {}\n\
             \n\
             # HELP civicvault_chunk_failures_total Chunk placements or fetches that failed\n\
             # TYPE civicvault_chunk_failures_total counter\n\
             civicvault_chunk_failures_total {}\n\
             \n\
             # HELP civicvault_files_stored_total Files distributed\n\
             # TYPE civicvault_files_stored_total counter\n\
             civicvault_files_stored_total {}\n\
             \n\
             # HELP civicvault_files_retrieved_total Files reassembled\n\
             # TYPE civicvault_files_retrieved_total counter\n\
             civicvault_files_retrieved_total {}\n\
             \n\
             # HELP civicvault_registrations_total Node registrations accepted\n\
             # TYPE civicvault_registrations_total counter\n\
             civicvault_registrations_total {}\n\
             \n\
             # HELP civicvault_assignment_failures_total Partition assignments that could not be delivered\n\
             # TYPE civicvault_assignment_failures_total counter\n\
             civicvault_assignment_failures_total {}\n\
             \n\
             # HELP civicvault_request_errors_total Control requests rejected or dropped\n\
             # TYPE civicvault_request_errors_total counter\n\
             civicvault_request_errors_total {}\n",
            nodes_online,
            file_count,
            self.uptime_seconds(),
            self.chunks_written(),
            self.bytes_written(),
            self.chunks_read(),
            self.bytes_read(),
            self.chunk_failures(),
            self.files_stored(),
            self.files_retrieved(),
            self.registrations(),
            self.assignment_failures(),
            self.request_errors(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
