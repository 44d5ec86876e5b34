//! Send worker: the only task that writes to the server socket.
//!
//! Transfers and session workers queue `Outgoing` packets; this task
//! encodes them and puts them on the wire in order.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use ridge_services::Outgoing;

pub struct SendWorker {
    socket: Arc<UdpSocket>,
    outbound_rx: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: broadcast::Receiver<()>,
}

impl SendWorker {
    pub fn new(
        socket: Arc<UdpSocket>,
        outbound_rx: mpsc::UnboundedReceiver<Outgoing>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            outbound_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    // Transfers still queue their final ERRORs; drain until
                    // every sender is gone.
                    while let Some(out) = self.outbound_rx.recv().await {
                        self.send(out).await;
                    }
                    tracing::info!("send worker shutting down");
                    return Ok(());
                }

                out = self.outbound_rx.recv() => {
                    let Some(out) = out else {
                        tracing::info!("outbound queue closed, send worker exiting");
                        return Ok(());
                    };
                    self.send(out).await;
                }
            }
        }
    }

    async fn send(&self, out: Outgoing) {
        let kind = out.packet.kind();
        let bytes = match out.packet.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(?kind, error = %e, "failed to encode packet, dropping");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, out.addr).await {
            tracing::warn!(?kind, peer = %out.addr, error = %e, "send_to failed");
        } else {
            tracing::trace!(?kind, peer = %out.addr, len = bytes.len(), "sent");
        }
    }
}
