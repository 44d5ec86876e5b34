//! Sent-chunk cache.
//!
//! Every chunk a transfer puts on the wire is kept here, indexed by
//! transfer id and then sequence, until the transfer is evicted. A NACK is
//! answered from the cache without touching the source file again.
//!
//! The cache is not shared on its own: it lives inside `ServerState` and is
//! only reached through the server's single lock.

use std::collections::HashMap;

use bytes::Bytes;
use ridge_core::checksum::Checksum;

/// One chunk exactly as it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub sequence: u32,
    pub payload: Bytes,
    pub checksum: Checksum,
}

#[derive(Debug, Default)]
pub struct ChunkCache {
    transfers: HashMap<u64, HashMap<u32, ChunkRecord>>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk. Re-storing the same sequence replaces it.
    pub fn put(&mut self, transfer_id: u64, record: ChunkRecord) {
        self.transfers
            .entry(transfer_id)
            .or_default()
            .insert(record.sequence, record);
    }

    pub fn get(&self, transfer_id: u64, sequence: u32) -> Option<&ChunkRecord> {
        self.transfers.get(&transfer_id)?.get(&sequence)
    }

    /// Drop every chunk of a transfer. Returns how many were dropped.
    pub fn evict(&mut self, transfer_id: u64) -> usize {
        self.transfers
            .remove(&transfer_id)
            .map(|chunks| chunks.len())
            .unwrap_or(0)
    }

    /// Total cached chunks across all transfers (for stats/debugging).
    pub fn count(&self) -> usize {
        self.transfers.values().map(HashMap::len).sum()
    }

    /// Total cached payload bytes (for stats/debugging).
    pub fn size(&self) -> u64 {
        self.transfers
            .values()
            .flat_map(HashMap::values)
            .map(|r| r.payload.len() as u64)
            .sum()
    }
}
