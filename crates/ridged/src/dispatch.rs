//! Server receive loop.
//!
//! One UDP socket serves every client. Each datagram is decoded, keyed to
//! its client, and pushed onto that client's session queue; a session
//! worker is spawned the first time a client is seen. The loop also runs
//! the eviction sweep and the periodic status report.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use ridge_core::config::RidgeConfig;
use ridge_core::wire::{Packet, RECV_BUFFER_SIZE};
use ridge_services::{new_server_state, Catalog, ClientKey, Inbound, Outgoing, SharedState};

use crate::send_worker::SendWorker;
use crate::session::SessionWorker;
use crate::status;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

pub struct Server {
    socket: Arc<UdpSocket>,
    config: RidgeConfig,
    catalog: Arc<Catalog>,
    state: SharedState,
}

impl Server {
    pub async fn bind(config: RidgeConfig, catalog: Catalog) -> Result<Self> {
        let socket = UdpSocket::bind(config.server.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.server.bind))?;
        Ok(Self {
            socket: Arc::new(socket),
            config,
            catalog: Arc::new(catalog),
            state: new_server_state(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
        let mut shutdown = shutdown_tx.subscribe();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outgoing>();

        let send_worker = tokio::spawn(
            SendWorker::new(self.socket.clone(), outbound_rx, shutdown_tx.subscribe()).run(),
        );

        tracing::info!(
            addr = %self.local_addr()?,
            files = self.catalog.len(),
            "server listening"
        );

        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
        status_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }

                _ = sweep_interval.tick() => {
                    let report = self.state.lock().await.sweep(
                        Instant::now(),
                        self.config.transfer.eviction_grace(),
                        self.config.server.session_idle(),
                    );
                    for id in &report.evicted {
                        tracing::debug!(transfer_id = id, "transfer evicted");
                    }
                    for key in &report.expired {
                        tracing::info!(client = %key, "idle session expired");
                    }
                }

                _ = status_interval.tick() => {
                    status::log_status(&*self.state.lock().await);
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "session worker failed");
                    }
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, source) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };

                    let packet = match Packet::decode(&buf[..len]) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::debug!(%source, len, error = %e, "dropping malformed datagram");
                            continue;
                        }
                    };
                    self.dispatch(packet, source, &outbound_tx, &shutdown_tx, &mut sessions).await;
                }
            }
        }

        while sessions.join_next().await.is_some() {}
        drop(outbound_tx);
        match send_worker.await {
            Ok(Err(e)) => tracing::error!(error = %e, "send worker failed"),
            Err(e) => tracing::error!(error = %e, "send worker panicked"),
            Ok(Ok(())) => {}
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        packet: Packet,
        source: SocketAddr,
        outbound_tx: &mpsc::UnboundedSender<Outgoing>,
        shutdown_tx: &broadcast::Sender<()>,
        sessions: &mut JoinSet<()>,
    ) {
        let key = ClientKey::from_packet(source, &packet);
        tracing::trace!(client = %key, kind = ?packet.kind(), "received");

        let inbound = Inbound { packet, source };
        let mut state = self.state.lock().await;

        let delivered = match state.session(&key) {
            Some(session) => session.queue.send(inbound).map_err(|e| e.0),
            None => Err(inbound),
        };
        // A closed queue means the worker already exited; start a fresh one.
        let inbound = match delivered {
            Ok(()) => {
                state.touch_session(&key);
                return;
            }
            Err(inbound) => inbound,
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let _ = queue_tx.send(inbound);
        state.insert_session(key, queue_tx);
        drop(state);

        tracing::info!(client = %key, "new session");
        let worker = SessionWorker::new(
            key,
            queue_rx,
            self.state.clone(),
            self.catalog.clone(),
            self.config.transfer.clone(),
            outbound_tx.clone(),
            shutdown_tx.clone(),
        );
        sessions.spawn(worker.run());
    }
}
