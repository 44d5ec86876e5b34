//! One part: a byte range received on its own UDP socket.
//!
//! The socket's local port doubles as the part's `client_port`, so the
//! server sees every part as a separate client with a single transfer.

use std::io::SeekFrom;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;

use ridge_core::config::TransferConfig;
use ridge_core::wire::{Packet, RECV_BUFFER_SIZE};
use ridge_services::{ReceiveEvent, ReceiveState, Reassembly, SharedProgress, TransferError};

use crate::plan::PartPlan;

pub struct PartDownload {
    pub server: SocketAddr,
    pub file_name: String,
    pub plan: PartPlan,
    /// Pre-sized destination the part writes into at its offset.
    pub dest: PathBuf,
    pub transfer: TransferConfig,
    pub progress: SharedProgress,
}

impl PartDownload {
    /// Receive and write the part. Returns the number of bytes written.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<u64, TransferError> {
        let socket = bind_for(self.server).await?;
        let client_port = socket.local_addr()?.port();
        let mut reassembly = Reassembly::new(
            self.file_name.clone(),
            self.plan.offset,
            self.plan.length,
            Some(client_port),
            self.transfer.max_receive_timeouts,
        );

        tracing::debug!(
            file = %self.file_name,
            part = self.plan.index,
            offset = self.plan.offset,
            length = self.plan.length,
            client_port,
            "part starting"
        );

        send(&socket, self.server, &reassembly.request()).await?;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.recv() => return Err(TransferError::Shutdown),
                r = tokio::time::timeout(self.transfer.receive_timeout(), socket.recv_from(&mut buf)) => r,
            };

            let packet = match received {
                Err(_) => {
                    match reassembly.on_timeout() {
                        ReceiveEvent::Failed(e) => {
                            self.notify_failure(&socket, &reassembly, &e).await;
                            return Err(e);
                        }
                        _ if reassembly.state() == ReceiveState::AwaitStart => {
                            tracing::debug!(file = %self.file_name, part = self.plan.index, "no START yet, resending DOWNLOAD");
                            send(&socket, self.server, &reassembly.request()).await?;
                        }
                        _ => {}
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::warn!(file = %self.file_name, part = self.plan.index, error = %e, "recv_from failed");
                    continue;
                }
                Ok(Ok((len, from))) => {
                    if from != self.server {
                        tracing::trace!(%from, "datagram from unexpected peer ignored");
                        continue;
                    }
                    match Packet::decode(&buf[..len]) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping malformed datagram");
                            continue;
                        }
                    }
                }
            };

            let step = reassembly.handle(packet);
            if let Some(reply) = &step.reply {
                send(&socket, self.server, reply).await?;
            }

            match step.event {
                ReceiveEvent::Stored { bytes, .. } => {
                    self.progress.add_received(self.plan.index, bytes as u64).await;
                }
                ReceiveEvent::Completed => break,
                ReceiveEvent::Failed(e) => return Err(e),
                ReceiveEvent::Rejected { sequence } => {
                    tracing::debug!(file = %self.file_name, part = self.plan.index, sequence, "chunk rejected");
                }
                _ => {}
            }
        }

        let data = reassembly.assemble();
        self.write(&data).await?;
        self.progress.mark_complete(self.plan.index).await;
        tracing::debug!(file = %self.file_name, part = self.plan.index, "part complete");

        self.linger(&socket, &mut reassembly, &mut buf).await;
        Ok(data.len() as u64)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransferError> {
        if data.len() as u64 != self.plan.length {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "part {} reassembled {} bytes, expected {}",
                    self.plan.index,
                    data.len(),
                    self.plan.length
                ),
            )));
        }

        let mut file = tokio::fs::OpenOptions::new().write(true).open(&self.dest).await?;
        file.seek(SeekFrom::Start(self.plan.offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Keep answering retransmitted END/DATA for a while, in case our last
    /// ACK was lost and the server is still waiting on it.
    async fn linger(&self, socket: &UdpSocket, reassembly: &mut Reassembly, buf: &mut [u8]) {
        let deadline = Instant::now() + self.transfer.end_linger();
        while let Ok(Ok((len, from))) = tokio::time::timeout_at(deadline, socket.recv_from(buf)).await {
            if from != self.server {
                continue;
            }
            let Ok(packet) = Packet::decode(&buf[..len]) else {
                continue;
            };
            if let Some(reply) = reassembly.handle(packet).reply {
                let _ = send(socket, self.server, &reply).await;
            }
        }
    }

    /// Tell the server we gave up, so it stops resending.
    async fn notify_failure(&self, socket: &UdpSocket, reassembly: &Reassembly, error: &TransferError) {
        let Some(transfer_id) = reassembly.transfer_id() else {
            return;
        };
        let packet = Packet::error(Some(self.file_name.clone()), Some(transfer_id), error.to_string())
            .with_client_port(socket.local_addr().ok().map(|a| a.port()));
        let _ = send(socket, self.server, &packet).await;
    }
}

/// Bind an ephemeral socket of the same family as `server`.
pub async fn bind_for(server: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    UdpSocket::bind(local).await
}

pub async fn send(socket: &UdpSocket, addr: SocketAddr, packet: &Packet) -> Result<(), TransferError> {
    let bytes = packet.encode()?;
    socket.send_to(&bytes, addr).await?;
    Ok(())
}
