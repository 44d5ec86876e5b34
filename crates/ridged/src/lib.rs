//! ridged: reliable-UDP file server.
//!
//! `Server` owns the socket and the shared state; per-client session
//! workers and per-transfer senders run under it as tokio tasks.

pub mod dispatch;
pub mod send_worker;
pub mod session;
pub mod status;

pub use dispatch::Server;
