//! ridge-core: wire format, checksums, and configuration shared by the
//! ridge server and client. No I/O lives here.

pub mod checksum;
pub mod config;
pub mod wire;

pub use checksum::{checksum, verify_checksum, Checksum};
pub use wire::{parse_packet, Frame, Packet, PacketKind, ProtocolError};
