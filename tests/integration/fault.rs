use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::task::{JoinHandle, JoinSet};

use ridge_core::wire::{Packet, RECV_BUFFER_SIZE};

// ── LossyRelay ─────────────────────────────────────────────────────────────

/// UDP relay between clients and a server.
///
/// Like a NAT, it gives every client address its own upstream socket, so
/// the server still sees distinct sources and replies find their way back.
/// Server→client DATA can be dropped according to `DropRule`.
pub struct LossyRelay {
    pub addr: SocketAddr,
    pub stats: Arc<RelayStats>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropRule {
    Nothing,
    /// Drop the first DATA carrying file offset 0, once.
    FirstChunkOnce,
    /// Drop every DATA.
    AllData,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    /// DATA packets with file offset 0 seen from the server, dropped or not.
    pub first_chunk_data: AtomicUsize,
    pub dropped: AtomicUsize,
    pub errors_to_client: AtomicUsize,
}

impl LossyRelay {
    pub async fn start(upstream: SocketAddr, rule: DropRule) -> Result<Self> {
        let front = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let addr = front.local_addr()?;
        let stats = Arc::new(RelayStats::default());
        let task = tokio::spawn(relay_loop(front, upstream, rule, stats.clone()));
        Ok(Self { addr, stats, task })
    }

    pub fn first_chunk_data(&self) -> usize {
        self.stats.first_chunk_data.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.stats.dropped.load(Ordering::SeqCst)
    }
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay_loop(front: Arc<UdpSocket>, upstream: SocketAddr, rule: DropRule, stats: Arc<RelayStats>) {
    let mut routes: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
    let mut backward = JoinSet::new();
    let dropped_once = Arc::new(AtomicBool::new(false));
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let Ok((len, client)) = front.recv_from(&mut buf).await else {
            continue;
        };

        let route = match routes.get(&client) {
            Some(route) => route.clone(),
            None => {
                let Ok(socket) = UdpSocket::bind("127.0.0.1:0").await else {
                    continue;
                };
                let socket = Arc::new(socket);
                routes.insert(client, socket.clone());
                backward.spawn(server_to_client(
                    socket.clone(),
                    front.clone(),
                    client,
                    rule,
                    stats.clone(),
                    dropped_once.clone(),
                ));
                socket
            }
        };
        let _ = route.send_to(&buf[..len], upstream).await;
    }
}

async fn server_to_client(
    upstream: Arc<UdpSocket>,
    front: Arc<UdpSocket>,
    client: SocketAddr,
    rule: DropRule,
    stats: Arc<RelayStats>,
    dropped_once: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let Ok((len, _)) = upstream.recv_from(&mut buf).await else {
            continue;
        };

        let drop_it = match Packet::decode(&buf[..len]) {
            Ok(Packet::Data { offset, .. }) => {
                if offset == 0 {
                    stats.first_chunk_data.fetch_add(1, Ordering::SeqCst);
                }
                match rule {
                    DropRule::Nothing => false,
                    DropRule::FirstChunkOnce => offset == 0 && !dropped_once.swap(true, Ordering::SeqCst),
                    DropRule::AllData => true,
                }
            }
            Ok(Packet::Error { .. }) => {
                stats.errors_to_client.fetch_add(1, Ordering::SeqCst);
                false
            }
            _ => false,
        };

        if drop_it {
            stats.dropped.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        let _ = front.send_to(&buf[..len], client).await;
    }
}
