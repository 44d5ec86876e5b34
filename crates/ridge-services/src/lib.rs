//! ridge-services: transfer logic shared by the ridge server and client.
//!
//! The reliability engine (`reliability`) drives one chunked byte range
//! over an unreliable datagram channel: the sender half runs on the server,
//! the receiver half on the client. `state` holds the server's coarse-locked
//! tables, `progress` the client's per-file part accounting.

pub mod cache;
pub mod catalog;
pub mod error;
pub mod progress;
pub mod reliability;
pub mod state;

pub use cache::{ChunkCache, ChunkRecord};
pub use catalog::{Catalog, CatalogEntry};
pub use error::TransferError;
pub use progress::{FileProgress, PartProgress, ProgressSnapshot, SharedProgress};
pub use reliability::{
    total_chunks, ChunkSender, Outgoing, OutboundTx, ReceiveEvent, ReceiveState, Reassembly,
    RetryPolicy, Step, TransferRequest,
};
pub use state::{
    new_server_state, ClientKey, Inbound, ServerState, SessionHandle, SharedState, SweepReport,
    TransferEntry, TransferSnapshot, TransferStatus,
};
