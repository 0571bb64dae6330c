//! WebSocket server for accepting client connections.
//!
//! Owns the live connections and the channel their read tasks feed. The
//! protocol itself lives in [`lfcc_core::SyncEngine`]; this layer only moves
//! frames.

use crate::connection::{ClientConnection, ConnectionEvent};
use anyhow::Result;
use lfcc_core::ConnectionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

/// WebSocket server managing client connections.
pub struct WebSocketServer {
    connections: HashMap<ConnectionId, ClientConnection>,
    next_conn_id: ConnectionId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            connections: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade a new TCP connection. Returns its id, or `None` if the upgrade failed.
    pub async fn accept_connection(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Option<ConnectionId> {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return None;
            }
        };

        let conn = self.next_conn_id;
        self.next_conn_id += 1;

        info!("New connection from {} (conn: {})", addr, conn);
        self.connections.insert(
            conn,
            ClientConnection::new(conn, ws_stream, self.event_tx.clone()),
        );
        Some(conn)
    }

    /// Wait for the next frame or close from any connection.
    pub async fn recv_event(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Send data to a specific connection.
    pub async fn send(&self, conn: ConnectionId, data: &[u8]) -> Result<()> {
        let connection = self
            .connections
            .get(&conn)
            .ok_or_else(|| anyhow::anyhow!("Unknown connection: {}", conn))?;

        connection.send(data).await
    }

    /// Close a connection from the server side.
    pub async fn close(&mut self, conn: ConnectionId) {
        if let Some(mut connection) = self.connections.remove(&conn) {
            connection.close().await;
            debug!("Closed connection {}", conn);
        }
    }

    /// Forget a connection whose socket already closed.
    pub fn remove(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
