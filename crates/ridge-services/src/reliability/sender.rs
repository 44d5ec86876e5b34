//! Sender half: streams one byte range as START, DATA 0..n, END.
//!
//! Each packet is resent on every ack timeout (and every matching NACK)
//! until it is acknowledged or the retry ceiling is hit. Acknowledgments
//! arrive through the transfer's inbox, fed by the session worker that
//! routes ACK/NACK/ERROR by transfer id.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use ridge_core::checksum::checksum;
use ridge_core::wire::{Frame, Packet};

use super::{total_chunks, Outgoing, OutboundTx, RetryPolicy};
use crate::cache::ChunkRecord;
use crate::error::TransferError;
use crate::state::{SharedState, TransferStatus};

/// Everything needed to serve one DOWNLOAD.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: u64,
    pub file_name: String,
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
    pub chunk_size: usize,
    pub peer: SocketAddr,
    pub client_port: Option<u16>,
}

impl TransferRequest {
    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.length, self.chunk_size)
    }

    /// Absolute file offset of chunk `sequence`.
    fn chunk_offset(&self, sequence: u32) -> u64 {
        self.offset + u64::from(sequence) * self.chunk_size as u64
    }

    fn chunk_len(&self, sequence: u32) -> usize {
        let end = self.offset + self.length;
        (end - self.chunk_offset(sequence)).min(self.chunk_size as u64) as usize
    }
}

pub struct ChunkSender {
    request: TransferRequest,
    policy: RetryPolicy,
    state: SharedState,
    outbound: OutboundTx,
    inbox: mpsc::UnboundedReceiver<Packet>,
    shutdown: broadcast::Receiver<()>,
}

impl ChunkSender {
    pub fn new(
        request: TransferRequest,
        policy: RetryPolicy,
        state: SharedState,
        outbound: OutboundTx,
        inbox: mpsc::UnboundedReceiver<Packet>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            request,
            policy,
            state,
            outbound,
            inbox,
            shutdown,
        }
    }

    /// Run the transfer to a terminal state and record it.
    pub async fn run(mut self) -> TransferStatus {
        let id = self.request.id;
        let result = self.stream().await;

        let (status, error) = match result {
            Ok(()) => {
                tracing::info!(
                    transfer_id = id,
                    file = %self.request.file_name,
                    offset = self.request.offset,
                    length = self.request.length,
                    "transfer complete"
                );
                (TransferStatus::Completed, None)
            }
            Err(e) => {
                tracing::warn!(transfer_id = id, file = %self.request.file_name, error = %e, "transfer failed");
                if e.notify_peer() {
                    let error = Packet::error(Some(self.request.file_name.clone()), Some(id), e.to_string());
                    if let Err(send_err) = self.send(error) {
                        tracing::debug!(transfer_id = id, error = %send_err, "failed to queue ERROR for peer");
                    }
                }
                (TransferStatus::Error, Some(e.to_string()))
            }
        };

        self.state.lock().await.finish(id, status, error);
        status
    }

    async fn stream(&mut self) -> Result<(), TransferError> {
        let id = self.request.id;
        let total = self.request.total_chunks();

        let start = Packet::Start {
            file_name: self.request.file_name.clone(),
            transfer_id: id,
            total_chunks: total,
            offset: self.request.offset,
            length: self.request.length,
            client_port: None,
        };
        self.deliver(start, Frame::Start).await?;
        self.state.lock().await.set_status(id, TransferStatus::InProgress);

        let mut file = tokio::fs::File::open(&self.request.path).await?;
        for sequence in 0..total {
            let record = self.read_chunk(&mut file, sequence).await?;
            let packet = self.data_packet(&record);
            self.state.lock().await.cache_chunk(id, record);

            self.deliver(packet, Frame::Chunk(sequence)).await?;
            self.state.lock().await.record_progress(id, sequence);
        }

        let end = Packet::End {
            file_name: self.request.file_name.clone(),
            transfer_id: id,
            client_port: None,
        };
        self.deliver(end, Frame::End).await
    }

    async fn read_chunk(
        &self,
        file: &mut tokio::fs::File,
        sequence: u32,
    ) -> Result<ChunkRecord, TransferError> {
        let mut buf = vec![0u8; self.request.chunk_len(sequence)];
        file.seek(SeekFrom::Start(self.request.chunk_offset(sequence))).await?;
        file.read_exact(&mut buf).await?;

        let payload = Bytes::from(buf);
        Ok(ChunkRecord {
            sequence,
            checksum: checksum(&payload),
            payload,
        })
    }

    fn data_packet(&self, record: &ChunkRecord) -> Packet {
        Packet::Data {
            file_name: self.request.file_name.clone(),
            transfer_id: self.request.id,
            sequence: record.sequence,
            offset: self.request.chunk_offset(record.sequence),
            payload: record.payload.clone(),
            checksum: record.checksum,
            client_port: None,
        }
    }

    /// Send `packet` and wait for the ACK of `expect`, resending on timeout
    /// or NACK. At most `1 + max_retries` sends.
    async fn deliver(&mut self, packet: Packet, expect: Frame) -> Result<(), TransferError> {
        let id = self.request.id;
        let mut retries = 0u32;

        self.send(packet.clone())?;
        let mut deadline = Instant::now() + self.policy.ack_timeout;

        loop {
            let reply = tokio::select! {
                _ = self.shutdown.recv() => return Err(TransferError::Shutdown),
                reply = tokio::time::timeout_at(deadline, self.inbox.recv()) => reply,
            };

            match reply {
                Err(_) => {
                    if retries >= self.policy.max_retries {
                        return Err(TransferError::Timeout { frame: expect, retries });
                    }
                    retries += 1;
                    tracing::debug!(transfer_id = id, %expect, retries, "ack timeout, resending");
                    self.resend(packet.clone()).await?;
                }
                Ok(None) => return Err(TransferError::Shutdown),
                Ok(Some(Packet::Ack { sequence, .. })) if sequence == expect => return Ok(()),
                Ok(Some(Packet::Nack { sequence, .. })) if Frame::Chunk(sequence) == expect => {
                    let Some(record) = self.state.lock().await.cached_chunk(id, sequence) else {
                        tracing::warn!(transfer_id = id, sequence, "NACK for uncached chunk ignored");
                        continue;
                    };
                    if retries >= self.policy.max_retries {
                        return Err(TransferError::ChecksumMismatch { sequence });
                    }
                    retries += 1;
                    tracing::debug!(transfer_id = id, sequence, retries, "NACK, resending chunk");
                    self.resend(self.data_packet(&record)).await?;
                }
                Ok(Some(Packet::Error { reason, .. })) => return Err(TransferError::Aborted(reason)),
                Ok(Some(stale)) => {
                    tracing::trace!(transfer_id = id, kind = ?stale.kind(), "stale reply ignored");
                    continue;
                }
            }
            deadline = Instant::now() + self.policy.ack_timeout;
        }
    }

    async fn resend(&self, packet: Packet) -> Result<(), TransferError> {
        self.state.lock().await.record_retransmission(self.request.id);
        self.send(packet)
    }

    fn send(&self, packet: Packet) -> Result<(), TransferError> {
        let packet = packet.with_client_port(self.request.client_port);
        self.outbound
            .send(Outgoing {
                addr: self.request.peer,
                packet,
            })
            .map_err(|_| TransferError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use crate::reliability::{ReceiveEvent, Reassembly};
    use crate::state::{new_server_state, ClientKey, TransferEntry};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_file(contents: &[u8]) -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("ridge-sender-test-{}-{}", std::process::id(), id));
        std::fs::write(&path, contents).unwrap();
        path
    }

    struct Harness {
        sender: ChunkSender,
        state: SharedState,
        out_rx: mpsc::UnboundedReceiver<Outgoing>,
        inbox_tx: mpsc::UnboundedSender<Packet>,
        _shutdown_tx: broadcast::Sender<()>,
    }

    async fn harness(contents: &[u8], chunk_size: usize, max_retries: u32) -> Harness {
        let path = temp_file(contents);
        let peer: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let state = new_server_state();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let request = TransferRequest {
            id: 1,
            file_name: "f".into(),
            path,
            offset: 0,
            length: contents.len() as u64,
            chunk_size,
            peer,
            client_port: Some(7000),
        };
        state.lock().await.register_transfer(TransferEntry {
            id: 1,
            client: ClientKey { ip: peer.ip(), port: 7000 },
            peer,
            file_name: "f".into(),
            offset: 0,
            length: request.length,
            total_chunks: request.total_chunks(),
            status: TransferStatus::Starting,
            current_sequence: None,
            chunks_sent: 0,
            retransmissions: 0,
            inbox: inbox_tx.clone(),
            finished_at: None,
            error: None,
        });

        let policy = RetryPolicy {
            ack_timeout: Duration::from_millis(500),
            max_retries,
        };
        Harness {
            sender: ChunkSender::new(request, policy, state.clone(), out_tx, inbox_rx, shutdown_rx),
            state,
            out_rx,
            inbox_tx,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[test]
    fn chunk_geometry_covers_range() {
        let request = TransferRequest {
            id: 1,
            file_name: "f".into(),
            path: PathBuf::new(),
            offset: 100,
            length: 10,
            chunk_size: 4,
            peer: "127.0.0.1:1".parse().unwrap(),
            client_port: None,
        };
        assert_eq!(request.total_chunks(), 3);
        assert_eq!(request.chunk_offset(2), 108);
        assert_eq!(request.chunk_len(0), 4);
        assert_eq!(request.chunk_len(2), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_start_fails_after_retry_ceiling() {
        let Harness { sender, state, mut out_rx, inbox_tx: _inbox, _shutdown_tx: _shutdown } =
            harness(b"hello", 4, 3).await;

        let status = sender.run().await;
        assert_eq!(status, TransferStatus::Error);

        let mut starts = 0;
        let mut errors = Vec::new();
        while let Ok(out) = out_rx.try_recv() {
            assert_eq!(out.packet.client_port(), Some(7000));
            match out.packet {
                Packet::Start { .. } => starts += 1,
                Packet::Error { reason, transfer_id, .. } => {
                    assert_eq!(transfer_id, Some(1));
                    errors.push(reason);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(starts, 4);
        assert_eq!(errors, vec!["no acknowledgment for START after 3 retries".to_string()]);

        let snap = state.lock().await.snapshot();
        assert_eq!(snap[0].status, TransferStatus::Error);
        assert_eq!(snap[0].retransmissions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_to_receiver_and_recovers_from_corruption() {
        let contents: Vec<u8> = (0..=250u8).collect();
        let Harness { sender, state, mut out_rx, inbox_tx, _shutdown_tx: _shutdown } =
            harness(&contents, 64, 8).await;

        let peer = tokio::spawn(async move {
            let mut receiver = Reassembly::new("f", 0, 251, Some(7000), 5);
            let mut corrupted = false;
            let mut first_chunk_sends = 0;
            while let Some(Outgoing { packet, .. }) = out_rx.recv().await {
                let packet = match packet {
                    Packet::Data { sequence: 0, .. } => {
                        first_chunk_sends += 1;
                        if !corrupted {
                            corrupted = true;
                            corrupt(packet)
                        } else {
                            packet
                        }
                    }
                    other => other,
                };
                let step = receiver.handle(packet);
                if let Some(reply) = step.reply {
                    let _ = inbox_tx.send(reply);
                }
                if matches!(step.event, ReceiveEvent::Completed) {
                    break;
                }
            }
            (receiver.assemble(), first_chunk_sends)
        });

        let status = sender.run().await;
        assert_eq!(status, TransferStatus::Completed);

        let (assembled, first_chunk_sends) = peer.await.unwrap();
        assert_eq!(assembled, contents);
        assert_eq!(first_chunk_sends, 2);

        let snap = state.lock().await.snapshot();
        assert_eq!(snap[0].status, TransferStatus::Completed);
        assert_eq!(snap[0].chunks_sent, 4);
        assert_eq!(snap[0].retransmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_error_aborts_without_echo() {
        let Harness { sender, mut out_rx, inbox_tx, _shutdown_tx: _shutdown, .. } =
            harness(b"abc", 4, 8).await;
        inbox_tx
            .send(Packet::error(Some("f".into()), Some(1), "client gave up"))
            .unwrap();

        assert_eq!(sender.run().await, TransferStatus::Error);
        assert!(matches!(out_rx.try_recv().unwrap().packet, Packet::Start { .. }));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_nacks_exhaust_the_retry_ceiling() {
        let Harness { sender, state, mut out_rx, inbox_tx, _shutdown_tx: _shutdown } =
            harness(b"abcd", 4, 3).await;

        // Acknowledge START, reject every copy of chunk 0.
        let peer = tokio::spawn(async move {
            let mut data_sends = 0;
            let mut errors = Vec::new();
            while let Some(Outgoing { packet, .. }) = out_rx.recv().await {
                match packet {
                    Packet::Start { .. } => {
                        let _ = inbox_tx.send(Packet::Ack {
                            file_name: "f".into(),
                            transfer_id: Some(1),
                            sequence: Frame::Start,
                            client_port: Some(7000),
                        });
                    }
                    Packet::Data { sequence, .. } => {
                        data_sends += 1;
                        let _ = inbox_tx.send(Packet::Nack {
                            file_name: "f".into(),
                            transfer_id: Some(1),
                            sequence,
                            client_port: Some(7000),
                        });
                    }
                    Packet::Error { reason, .. } => errors.push(reason),
                    other => panic!("unexpected {other:?}"),
                }
            }
            (data_sends, errors)
        });

        assert_eq!(sender.run().await, TransferStatus::Error);
        let (data_sends, errors) = peer.await.unwrap();
        assert_eq!(data_sends, 4);
        assert_eq!(errors, vec!["chunk 0 failed checksum verification".to_string()]);

        let snap = state.lock().await.snapshot();
        assert_eq!(snap[0].retransmissions, 3);
        assert_eq!(snap[0].error.as_deref(), Some("chunk 0 failed checksum verification"));
    }

    #[tokio::test(start_paused = true)]
    async fn nack_for_uncached_chunk_is_ignored() {
        let Harness { mut sender, state, mut out_rx, inbox_tx, _shutdown_tx: _shutdown } =
            harness(b"abcd", 4, 3).await;

        // Nothing cached yet: the NACK must neither resend nor count a retry.
        inbox_tx
            .send(Packet::Nack {
                file_name: "f".into(),
                transfer_id: Some(1),
                sequence: 0,
                client_port: None,
            })
            .unwrap();
        inbox_tx
            .send(Packet::Ack {
                file_name: "f".into(),
                transfer_id: Some(1),
                sequence: Frame::Chunk(0),
                client_port: None,
            })
            .unwrap();

        let data = Packet::data("f", 1, 0, 0, Bytes::from_static(b"abcd"));
        sender.deliver(data, Frame::Chunk(0)).await.unwrap();

        assert!(matches!(out_rx.try_recv().unwrap().packet, Packet::Data { sequence: 0, .. }));
        assert!(out_rx.try_recv().is_err());
        assert_eq!(state.lock().await.snapshot()[0].retransmissions, 0);
    }

    fn corrupt(packet: Packet) -> Packet {
        match packet {
            Packet::Data { file_name, transfer_id, sequence, offset, payload, checksum, client_port } => {
                let mut bytes = payload.to_vec();
                bytes[0] ^= 0xff;
                Packet::Data {
                    file_name,
                    transfer_id,
                    sequence,
                    offset,
                    payload: Bytes::from(bytes),
                    checksum,
                    client_port,
                }
            }
            other => other,
        }
    }
}
