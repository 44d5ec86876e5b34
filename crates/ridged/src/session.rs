//! Per-client session worker.
//!
//! The dispatcher hands every packet from one client (keyed by source IP
//! and logical port) to that client's worker, in arrival order. The worker
//! answers LIST, validates DOWNLOAD and spawns a transfer for it, and
//! forwards ACK/NACK/ERROR to the transfer they belong to.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use ridge_core::config::TransferConfig;
use ridge_core::wire::Packet;
use ridge_services::{
    Catalog, ChunkSender, ClientKey, Inbound, Outgoing, OutboundTx, RetryPolicy, SharedState,
    TransferEntry, TransferError, TransferRequest, TransferStatus,
};

pub struct SessionWorker {
    key: ClientKey,
    queue: mpsc::UnboundedReceiver<Inbound>,
    state: SharedState,
    catalog: Arc<Catalog>,
    transfer: TransferConfig,
    outbound: OutboundTx,
    shutdown_tx: broadcast::Sender<()>,
    shutdown: broadcast::Receiver<()>,
    transfers: JoinSet<TransferStatus>,
}

impl SessionWorker {
    pub fn new(
        key: ClientKey,
        queue: mpsc::UnboundedReceiver<Inbound>,
        state: SharedState,
        catalog: Arc<Catalog>,
        transfer: TransferConfig,
        outbound: OutboundTx,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let shutdown = shutdown_tx.subscribe();
        Self {
            key,
            queue,
            state,
            catalog,
            transfer,
            outbound,
            shutdown_tx,
            shutdown,
            transfers: JoinSet::new(),
        }
    }

    pub async fn run(mut self) {
        tracing::debug!(client = %self.key, "session started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    // Transfers see the same signal; wait for their final ERRORs.
                    while self.transfers.join_next().await.is_some() {}
                    tracing::debug!(client = %self.key, "session shutting down");
                    return;
                }

                Some(joined) = self.transfers.join_next(), if !self.transfers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(client = %self.key, error = %e, "transfer task failed");
                    }
                }

                inbound = self.queue.recv() => {
                    let Some(inbound) = inbound else {
                        // Session expired; nothing is running for this client.
                        self.transfers.shutdown().await;
                        tracing::debug!(client = %self.key, "session closed");
                        return;
                    };
                    self.handle(inbound).await;
                }
            }
        }
    }

    async fn handle(&mut self, inbound: Inbound) {
        let Inbound { packet, source } = inbound;
        let reply_port = packet.client_port();

        match packet {
            Packet::List { files: None, .. } => {
                let listing = self.catalog.listing();
                tracing::info!(client = %self.key, files = listing.len(), "LIST");
                self.reply(
                    source,
                    Packet::List {
                        files: Some(listing),
                        client_port: reply_port,
                    },
                );
            }

            Packet::Download {
                file_name,
                offset,
                length,
                ..
            } => {
                self.download(source, reply_port, file_name, offset, length)
                    .await;
            }

            control @ (Packet::Ack { .. } | Packet::Nack { .. } | Packet::Error { .. }) => {
                let inbox = self.state.lock().await.route(
                    &self.key,
                    control.file_name(),
                    control.transfer_id(),
                );
                match inbox {
                    Some(inbox) => {
                        if inbox.send(control).is_err() {
                            tracing::debug!(client = %self.key, "transfer finished before control packet arrived");
                        }
                    }
                    None => tracing::trace!(
                        client = %self.key,
                        kind = ?control.kind(),
                        "no live transfer for control packet"
                    ),
                }
            }

            other => {
                tracing::debug!(client = %self.key, kind = ?other.kind(), "unexpected packet from client");
            }
        }
    }

    async fn download(
        &mut self,
        source: SocketAddr,
        reply_port: Option<u16>,
        file_name: String,
        offset: u64,
        length: u64,
    ) {
        let Some(entry) = self.catalog.lookup(&file_name) else {
            tracing::warn!(client = %self.key, file = %file_name, "DOWNLOAD of unknown file");
            let reason = TransferError::NotFound(file_name.clone()).to_string();
            self.reply(source, Packet::error(Some(file_name), None, reason).with_client_port(reply_port));
            return;
        };

        if offset > entry.size {
            tracing::warn!(client = %self.key, file = %file_name, offset, size = entry.size, "DOWNLOAD past end of file");
            self.reply(
                source,
                Packet::error(Some(file_name), None, "invalid offset").with_client_port(reply_port),
            );
            return;
        }
        let length = length.min(entry.size - offset);
        let path = entry.path.clone();

        // Listed but gone from disk: refuse before any transfer exists.
        if let Err(e) = tokio::fs::metadata(&path).await {
            tracing::warn!(client = %self.key, file = %file_name, path = %path.display(), error = %e, "catalog file missing on disk");
            let reason = TransferError::NotFound(file_name.clone()).to_string();
            self.reply(source, Packet::error(Some(file_name), None, reason).with_client_port(reply_port));
            return;
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let request = {
            let mut state = self.state.lock().await;
            if let Some(live) = state.find_live_duplicate(&self.key, &file_name, offset, length) {
                tracing::debug!(client = %self.key, transfer_id = live, "duplicate DOWNLOAD ignored");
                return;
            }

            let id = state.next_transfer_id();
            let request = TransferRequest {
                id,
                file_name: file_name.clone(),
                path,
                offset,
                length,
                chunk_size: self.transfer.chunk_size,
                peer: source,
                client_port: reply_port,
            };
            state.register_transfer(TransferEntry {
                id,
                client: self.key,
                peer: source,
                file_name,
                offset,
                length,
                total_chunks: request.total_chunks(),
                status: TransferStatus::Starting,
                current_sequence: None,
                chunks_sent: 0,
                retransmissions: 0,
                inbox: inbox_tx,
                finished_at: None,
                error: None,
            });
            request
        };

        tracing::info!(
            client = %self.key,
            transfer_id = request.id,
            file = %request.file_name,
            offset = request.offset,
            length = request.length,
            chunks = request.total_chunks(),
            "transfer started"
        );

        let sender = ChunkSender::new(
            request,
            RetryPolicy::from_config(&self.transfer),
            self.state.clone(),
            self.outbound.clone(),
            inbox_rx,
            self.shutdown_tx.subscribe(),
        );
        self.transfers.spawn(sender.run());
    }

    fn reply(&self, addr: SocketAddr, packet: Packet) {
        if let Err(e) = self.outbound.send(Outgoing { addr, packet }) {
            tracing::debug!(client = %self.key, kind = ?e.0.packet.kind(), "send worker gone, reply dropped");
        }
    }
}
