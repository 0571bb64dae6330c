//! The accept/route loop tying sockets, the sync engine and compaction together.

use crate::config::ServerConfig;
use crate::connection::ConnectionEvent;
use crate::scheduler::CompactionScheduler;
use crate::server::WebSocketServer;
use anyhow::Result;
use lfcc_core::clock::now_ms;
use lfcc_core::protocol::Message;
use lfcc_core::{EventBus, Outbound, SyncEngine, UpdateStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub struct Daemon {
    engine: SyncEngine,
    server: WebSocketServer,
    scheduler: CompactionScheduler,
    events: Arc<EventBus>,
    tick_interval: Duration,
}

impl Daemon {
    pub fn new(config: ServerConfig, store: Arc<dyn UpdateStore>) -> Self {
        let events = Arc::new(EventBus::new());
        let scheduler =
            CompactionScheduler::new(Arc::clone(&store), config.compaction, Arc::clone(&events));
        info!(
            "Server {} (policy {})",
            config.engine.server_id, config.engine.manifest.policy_id
        );

        Self {
            engine: SyncEngine::new(config.engine, store),
            server: WebSocketServer::new(),
            scheduler,
            events,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(10)),
        }
    }

    /// Bus carrying compaction events.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Serve until `shutdown` resolves.
    pub async fn run(mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut tick = tokio::time::interval(self.tick_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Some(conn) = self.server.accept_connection(stream, addr).await {
                                self.engine.open(conn, now_ms());
                            }
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(event) = self.server.recv_event() => {
                    self.handle_connection_event(event).await;
                }

                _ = tick.tick() => {
                    let outbound = self.engine.tick(now_ms());
                    self.dispatch(outbound).await;
                    self.scheduler.sync_timers(&self.engine.active_docs());
                }

                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        self.scheduler.shutdown();
        Ok(())
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { conn, data } => {
                let outbound = self.engine.handle(conn, &data, now_ms()).await;
                self.dispatch(outbound).await;
            }
            ConnectionEvent::Closed { conn } => {
                self.engine.close(conn);
                self.server.remove(conn);
                info!(
                    "Connection {} closed ({} remaining)",
                    conn,
                    self.server.connection_count()
                );
            }
        }
    }

    /// Perform the engine's outbound actions in order.
    async fn dispatch(&mut self, outbound: Vec<Outbound>) {
        for action in outbound {
            match action {
                Outbound::Send { conn, envelope } => {
                    if let Message::DocAck(ack) = &envelope.message {
                        if ack.applied {
                            self.scheduler.note_applied(&envelope.doc_id);
                        }
                    }
                    let json = match envelope.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!(
                                "Failed to encode {} for connection {}: {}",
                                envelope.message_type().as_str(),
                                conn,
                                e
                            );
                            continue;
                        }
                    };
                    if let Err(e) = self.server.send(conn, &json).await {
                        warn!("Failed to send to connection {}: {}", conn, e);
                        self.engine.close(conn);
                        self.server.close(conn).await;
                    }
                }
                Outbound::Close { conn, reason } => {
                    debug!("Closing connection {}: {}", conn, reason);
                    self.engine.close(conn);
                    self.server.close(conn).await;
                }
            }
        }
    }
}
