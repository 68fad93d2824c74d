//! Per-stream host I/O counters.

/// Host-visible traffic counters kept per stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamStats {
    pub reads_submitted: u64,
    pub writes_submitted: u64,
    pub reads_completed: u64,
    pub writes_completed: u64,
    pub sectors_read: u64,
    pub sectors_written: u64,
}
