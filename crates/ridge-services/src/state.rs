//! Server-side shared state.
//!
//! Client sessions, the transfer table and the sent-chunk cache live behind
//! one `tokio::sync::Mutex`. Every mutation of any of them happens under that
//! lock, and no lock is held across a network send or a file read.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use ridge_core::wire::Packet;

use crate::cache::{ChunkCache, ChunkRecord};

pub type SharedState = Arc<Mutex<ServerState>>;

pub fn new_server_state() -> SharedState {
    Arc::new(Mutex::new(ServerState::default()))
}

// ── Keys and handles ──────────────────────────────────────────────────────────

/// Identifies a client: source IP plus the logical port it asked to be
/// known by, falling back to the UDP source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl ClientKey {
    pub fn from_packet(source: SocketAddr, packet: &Packet) -> Self {
        Self {
            ip: source.ip(),
            port: packet.client_port().unwrap_or_else(|| source.port()),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

/// A decoded datagram and where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub packet: Packet,
    pub source: SocketAddr,
}

/// Entry in the session table. The queue feeds that client's session worker.
#[derive(Debug)]
pub struct SessionHandle {
    pub queue: mpsc::UnboundedSender<Inbound>,
    pub last_seen: Instant,
}

// ── Transfers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Starting,
    InProgress,
    Completed,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Error)
    }
}

/// One server-side transfer. Owned by the state table; the running sender
/// task only holds the id.
#[derive(Debug)]
pub struct TransferEntry {
    pub id: u64,
    pub client: ClientKey,
    pub peer: SocketAddr,
    pub file_name: String,
    pub offset: u64,
    pub length: u64,
    pub total_chunks: u32,
    pub status: TransferStatus,
    pub current_sequence: Option<u32>,
    pub chunks_sent: u32,
    pub retransmissions: u32,
    /// ACK/NACK/ERROR packets for this transfer are forwarded here.
    pub inbox: mpsc::UnboundedSender<Packet>,
    pub finished_at: Option<Instant>,
    pub error: Option<String>,
}

impl TransferEntry {
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Serializable view of a transfer for status logging and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub id: u64,
    pub client: String,
    pub file_name: String,
    pub offset: u64,
    pub length: u64,
    pub status: TransferStatus,
    pub chunks_sent: u32,
    pub total_chunks: u32,
    pub retransmissions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a sweep removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<u64>,
    pub expired: Vec<ClientKey>,
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ServerState {
    sessions: HashMap<ClientKey, SessionHandle>,
    transfers: HashMap<u64, TransferEntry>,
    cache: ChunkCache,
    next_id: u64,
}

impl ServerState {
    // Sessions

    pub fn session(&self, key: &ClientKey) -> Option<&SessionHandle> {
        self.sessions.get(key)
    }

    pub fn insert_session(&mut self, key: ClientKey, queue: mpsc::UnboundedSender<Inbound>) {
        self.sessions.insert(
            key,
            SessionHandle {
                queue,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn touch_session(&mut self, key: &ClientKey) {
        if let Some(session) = self.sessions.get_mut(key) {
            session.last_seen = Instant::now();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // Transfers

    /// Allocate a transfer id. Ids are never reused within a server run.
    pub fn next_transfer_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn register_transfer(&mut self, entry: TransferEntry) {
        self.transfers.insert(entry.id, entry);
    }

    pub fn transfer(&self, id: u64) -> Option<&TransferEntry> {
        self.transfers.get(&id)
    }

    /// A live transfer for exactly this request, if one is running.
    pub fn find_live_duplicate(
        &self,
        client: &ClientKey,
        file_name: &str,
        offset: u64,
        length: u64,
    ) -> Option<u64> {
        self.transfers
            .values()
            .find(|t| {
                t.is_live()
                    && t.client == *client
                    && t.file_name == file_name
                    && t.offset == offset
                    && t.length == length
            })
            .map(|t| t.id)
    }

    /// Inbox of the live transfer a control packet belongs to. An explicit
    /// `transfer_id` wins; without one, the newest live transfer for this
    /// client and file is chosen.
    pub fn route(
        &self,
        client: &ClientKey,
        file_name: Option<&str>,
        transfer_id: Option<u64>,
    ) -> Option<mpsc::UnboundedSender<Packet>> {
        let entry = match transfer_id {
            Some(id) => self
                .transfers
                .get(&id)
                .filter(|t| t.client == *client && t.is_live()),
            None => self
                .transfers
                .values()
                .filter(|t| {
                    t.client == *client
                        && t.is_live()
                        && file_name.map_or(true, |name| t.file_name == name)
                })
                .max_by_key(|t| t.id),
        }?;
        Some(entry.inbox.clone())
    }

    pub fn set_status(&mut self, id: u64, status: TransferStatus) {
        if let Some(t) = self.transfers.get_mut(&id) {
            t.status = status;
        }
    }

    pub fn record_progress(&mut self, id: u64, sequence: u32) {
        if let Some(t) = self.transfers.get_mut(&id) {
            t.current_sequence = Some(sequence);
            t.chunks_sent = t.chunks_sent.max(sequence + 1);
        }
    }

    pub fn record_retransmission(&mut self, id: u64) {
        if let Some(t) = self.transfers.get_mut(&id) {
            t.retransmissions += 1;
        }
    }

    /// Move a transfer to a terminal state and start its eviction clock.
    pub fn finish(&mut self, id: u64, status: TransferStatus, error: Option<String>) {
        if let Some(t) = self.transfers.get_mut(&id) {
            t.status = status;
            t.error = error;
            t.finished_at = Some(Instant::now());
        }
    }

    pub fn has_live_transfers(&self, client: &ClientKey) -> bool {
        self.transfers
            .values()
            .any(|t| t.client == *client && t.is_live())
    }

    // Cache

    pub fn cache_chunk(&mut self, transfer_id: u64, record: ChunkRecord) {
        self.cache.put(transfer_id, record);
    }

    pub fn cached_chunk(&self, transfer_id: u64, sequence: u32) -> Option<ChunkRecord> {
        self.cache.get(transfer_id, sequence).cloned()
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    // Maintenance

    /// Evict transfers that finished more than `grace` ago (with their
    /// cached chunks), and drop sessions idle for longer than `idle` that
    /// have nothing running. Dropping a session closes its worker's queue.
    pub fn sweep(&mut self, now: Instant, grace: Duration, idle: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let expired_transfers: Vec<u64> = self
            .transfers
            .values()
            .filter(|t| {
                t.finished_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= grace)
            })
            .map(|t| t.id)
            .collect();
        for id in expired_transfers {
            self.transfers.remove(&id);
            self.cache.evict(id);
            report.evicted.push(id);
        }

        let idle_sessions: Vec<ClientKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) >= idle)
            .map(|(k, _)| *k)
            .filter(|k| !self.has_live_transfers(k))
            .collect();
        for key in idle_sessions {
            self.sessions.remove(&key);
            report.expired.push(key);
        }

        report.evicted.sort_unstable();
        report
    }

    pub fn snapshot(&self) -> Vec<TransferSnapshot> {
        let mut out: Vec<TransferSnapshot> = self
            .transfers
            .values()
            .map(|t| TransferSnapshot {
                id: t.id,
                client: t.client.to_string(),
                file_name: t.file_name.clone(),
                offset: t.offset,
                length: t.length,
                status: t.status,
                chunks_sent: t.chunks_sent,
                total_chunks: t.total_chunks,
                retransmissions: t.retransmissions,
                error: t.error.clone(),
            })
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }
}
