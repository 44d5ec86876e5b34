//! Receiver half: a synchronous state machine fed one packet at a time.
//!
//! It never touches a socket. The caller sends `Step::reply` (if any) back
//! to the sender and reacts to `Step::event`. Every acknowledgment is
//! idempotent: a duplicate START, DATA or END is answered again without
//! changing what has been stored.

use std::collections::BTreeMap;

use bytes::Bytes;

use ridge_core::checksum::verify_checksum;
use ridge_core::wire::{Frame, Packet};

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    AwaitStart,
    Receiving,
    Reassembled,
    Incomplete,
}

impl ReceiveState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReceiveState::Reassembled | ReceiveState::Incomplete)
    }
}

#[derive(Debug)]
pub enum ReceiveEvent {
    /// Not for this transfer, out of order, or out of range.
    Ignored,
    /// A receive timeout that did not exhaust the budget.
    Idle,
    Started { transfer_id: u64, total_chunks: u32 },
    Stored { sequence: u32, bytes: usize },
    /// Already seen; re-acknowledged.
    Duplicate(Frame),
    /// Checksum mismatch; answered with a NACK.
    Rejected { sequence: u32 },
    Completed,
    Failed(TransferError),
}

/// What the caller should do after feeding a packet.
#[derive(Debug)]
pub struct Step {
    pub reply: Option<Packet>,
    pub event: ReceiveEvent,
}

impl Step {
    fn ignored() -> Self {
        Self {
            reply: None,
            event: ReceiveEvent::Ignored,
        }
    }
}

/// Receive-side state for one requested byte range.
#[derive(Debug)]
pub struct Reassembly {
    file_name: String,
    offset: u64,
    length: u64,
    client_port: Option<u16>,
    max_timeouts: u32,

    state: ReceiveState,
    transfer_id: Option<u64>,
    total_chunks: u32,
    chunks: BTreeMap<u32, Bytes>,
    received_bytes: u64,
    consecutive_timeouts: u32,
}

impl Reassembly {
    pub fn new(
        file_name: impl Into<String>,
        offset: u64,
        length: u64,
        client_port: Option<u16>,
        max_timeouts: u32,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            offset,
            length,
            client_port,
            max_timeouts,
            state: ReceiveState::AwaitStart,
            transfer_id: None,
            total_chunks: 0,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            consecutive_timeouts: 0,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    pub fn transfer_id(&self) -> Option<u64> {
        self.transfer_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// The DOWNLOAD request this reassembly expects an answer to.
    pub fn request(&self) -> Packet {
        Packet::Download {
            file_name: self.file_name.clone(),
            offset: self.offset,
            length: self.length,
            client_port: self.client_port,
        }
    }

    pub fn handle(&mut self, packet: Packet) -> Step {
        if packet.file_name().is_some_and(|name| name != self.file_name) {
            return Step::ignored();
        }

        match packet {
            Packet::Start {
                transfer_id,
                total_chunks,
                offset,
                length,
                ..
            } => self.on_start(transfer_id, total_chunks, offset, length),
            Packet::Data {
                transfer_id,
                sequence,
                payload,
                checksum,
                ..
            } => {
                if !self.owns(transfer_id) {
                    return Step::ignored();
                }
                self.consecutive_timeouts = 0;
                if !verify_checksum(&payload, &checksum) {
                    tracing::debug!(file = %self.file_name, sequence, "checksum mismatch, sending NACK");
                    return Step {
                        reply: Some(self.nack(sequence)),
                        event: ReceiveEvent::Rejected { sequence },
                    };
                }
                self.on_data(sequence, payload)
            }
            Packet::End { transfer_id, .. } => {
                if !self.owns(transfer_id) {
                    return Step::ignored();
                }
                self.consecutive_timeouts = 0;
                self.on_end()
            }
            Packet::Error {
                transfer_id, reason, ..
            } => {
                let ours = match (transfer_id, self.transfer_id) {
                    (Some(theirs), Some(mine)) => theirs == mine,
                    _ => true,
                };
                if !ours || self.state.is_terminal() {
                    return Step::ignored();
                }
                // A not-found refusal before START is terminal for this name.
                let not_found = TransferError::NotFound(self.file_name.clone());
                let error = if self.state == ReceiveState::AwaitStart && reason == not_found.to_string() {
                    not_found
                } else {
                    TransferError::Aborted(reason)
                };
                self.state = ReceiveState::Incomplete;
                Step {
                    reply: None,
                    event: ReceiveEvent::Failed(error),
                }
            }
            _ => Step::ignored(),
        }
    }

    /// Record a receive timeout. Fails the transfer once more than
    /// `max_timeouts` happen in a row.
    pub fn on_timeout(&mut self) -> ReceiveEvent {
        if self.state.is_terminal() {
            return ReceiveEvent::Idle;
        }
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts <= self.max_timeouts {
            return ReceiveEvent::Idle;
        }

        self.state = ReceiveState::Incomplete;
        let error = if self.transfer_id.is_none() {
            TransferError::Timeout {
                frame: Frame::Start,
                retries: self.consecutive_timeouts - 1,
            }
        } else {
            TransferError::IncompleteTransfer {
                received: self.received_chunks(),
                expected: self.total_chunks,
            }
        };
        ReceiveEvent::Failed(error)
    }

    /// All stored chunks concatenated in ascending sequence order.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        out
    }

    fn owns(&self, transfer_id: u64) -> bool {
        self.state != ReceiveState::AwaitStart && self.transfer_id == Some(transfer_id)
    }

    fn on_start(&mut self, transfer_id: u64, total_chunks: u32, offset: u64, length: u64) -> Step {
        match self.transfer_id {
            None => {
                if offset != self.offset || length != self.length {
                    tracing::debug!(
                        file = %self.file_name,
                        offset,
                        length,
                        "START for a different range, ignoring"
                    );
                    return Step::ignored();
                }
                self.transfer_id = Some(transfer_id);
                self.total_chunks = total_chunks;
                self.state = ReceiveState::Receiving;
                self.consecutive_timeouts = 0;
                Step {
                    reply: Some(self.ack(Frame::Start)),
                    event: ReceiveEvent::Started {
                        transfer_id,
                        total_chunks,
                    },
                }
            }
            Some(mine) if mine == transfer_id => Step {
                reply: Some(self.ack(Frame::Start)),
                event: ReceiveEvent::Duplicate(Frame::Start),
            },
            Some(_) => Step::ignored(),
        }
    }

    fn on_data(&mut self, sequence: u32, payload: Bytes) -> Step {
        if sequence >= self.total_chunks {
            tracing::debug!(file = %self.file_name, sequence, "sequence out of range, ignoring");
            return Step::ignored();
        }
        if self.chunks.contains_key(&sequence) {
            return Step {
                reply: Some(self.ack(Frame::Chunk(sequence))),
                event: ReceiveEvent::Duplicate(Frame::Chunk(sequence)),
            };
        }
        if self.state.is_terminal() {
            return Step::ignored();
        }

        let bytes = payload.len();
        self.received_bytes += bytes as u64;
        self.chunks.insert(sequence, payload);
        Step {
            reply: Some(self.ack(Frame::Chunk(sequence))),
            event: ReceiveEvent::Stored { sequence, bytes },
        }
    }

    fn on_end(&mut self) -> Step {
        let reply = Some(self.ack(Frame::End));
        if self.state.is_terminal() {
            return Step {
                reply,
                event: ReceiveEvent::Duplicate(Frame::End),
            };
        }

        let complete = self.received_chunks() == self.total_chunks
            && self.chunks.keys().copied().eq(0..self.total_chunks);
        let event = if complete {
            self.state = ReceiveState::Reassembled;
            ReceiveEvent::Completed
        } else {
            self.state = ReceiveState::Incomplete;
            ReceiveEvent::Failed(TransferError::IncompleteTransfer {
                received: self.received_chunks(),
                expected: self.total_chunks,
            })
        };
        Step { reply, event }
    }

    fn ack(&self, sequence: Frame) -> Packet {
        Packet::Ack {
            file_name: self.file_name.clone(),
            transfer_id: self.transfer_id,
            sequence,
            client_port: self.client_port,
        }
    }

    fn nack(&self, sequence: u32) -> Packet {
        Packet::Nack {
            file_name: self.file_name.clone(),
            transfer_id: self.transfer_id,
            sequence,
            client_port: self.client_port,
        }
    }
}
