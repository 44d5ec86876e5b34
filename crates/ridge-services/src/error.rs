//! Transfer error taxonomy.

use ridge_core::wire::{Frame, ProtocolError};

/// Why a transfer or part did not complete.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A chunk kept failing checksum verification at the receiver.
    #[error("chunk {sequence} failed checksum verification")]
    ChecksumMismatch { sequence: u32 },

    /// Retry ceiling reached while waiting for an acknowledgment.
    #[error("no acknowledgment for {frame} after {retries} retries")]
    Timeout { frame: Frame, retries: u32 },

    /// The requested file is not in the catalog.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Fewer distinct chunks arrived than the sender declared.
    #[error("incomplete transfer: {received} of {expected} chunks")]
    IncompleteTransfer { received: u32, expected: u32 },

    /// The peer reported a failure with an ERROR packet.
    #[error("aborted by peer: {0}")]
    Aborted(String),

    #[error("shutting down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransferError {
    /// Whether the peer should be told with an ERROR packet. A failure the
    /// peer reported itself is not echoed back.
    pub fn notify_peer(&self) -> bool {
        !matches!(self, TransferError::Aborted(_))
    }

    /// A later attempt from scratch could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::NotFound(_))
    }
}
