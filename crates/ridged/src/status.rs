//! Periodic status report: session count, cache usage and every transfer
//! still in the table.

use serde_json::json;

use ridge_services::{ServerState, TransferStatus};

pub fn log_status(state: &ServerState) {
    let transfers = state.snapshot();
    let live = transfers
        .iter()
        .filter(|t| !t.status.is_terminal())
        .count();

    tracing::info!(
        sessions = state.session_count(),
        transfers = transfers.len(),
        live,
        cached_chunks = state.cache().count(),
        cached_bytes = state.cache().size(),
        "server status"
    );

    for t in &transfers {
        if t.status == TransferStatus::InProgress || t.status == TransferStatus::Starting {
            tracing::info!(
                transfer_id = t.id,
                client = %t.client,
                file = %t.file_name,
                sent = t.chunks_sent,
                total = t.total_chunks,
                retransmissions = t.retransmissions,
                "  transfer"
            );
        }
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        let report = json!({
            "sessions": state.session_count(),
            "transfers": transfers,
        });
        tracing::debug!(report = %report, "status snapshot");
    }
}
