//! Stop-and-wait reliability over UDP.
//!
//! A transfer is START, then DATA 0..n, then END. The sender keeps exactly
//! one packet outstanding and does not move on until it is acknowledged.
//! The receiver acknowledges idempotently and reassembles by sequence.

mod receiver;
mod sender;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use ridge_core::config::TransferConfig;
use ridge_core::wire::Packet;

pub use receiver::{ReceiveEvent, ReceiveState, Reassembly, Step};
pub use sender::{ChunkSender, TransferRequest};

/// How long to wait for each acknowledgment and how often to resend.
/// A packet is sent at most `1 + max_retries` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout(),
            max_retries: config.max_retries,
        }
    }
}

/// Number of DATA packets needed for `length` bytes.
pub fn total_chunks(length: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    u32::try_from(length.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

/// A packet queued for the server socket.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub addr: SocketAddr,
    pub packet: Packet,
}

pub type OutboundTx = mpsc::UnboundedSender<Outgoing>;
