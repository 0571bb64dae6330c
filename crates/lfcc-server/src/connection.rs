//! Individual client connection management.
//!
//! Each connection wraps a WebSocket stream, handling the split between read
//! and write halves for async operation. Frames read from the socket are
//! forwarded to the server's event channel tagged with the connection id.

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use lfcc_core::protocol::MAX_MESSAGE_SIZE;
use lfcc_core::ConnectionId;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Received a frame from the client
    Message { conn: ConnectionId, data: Vec<u8> },
    /// Connection was closed by the client or failed
    Closed { conn: ConnectionId },
}

type WsSink = futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// A single WebSocket connection to a client.
pub struct ClientConnection {
    pub id: ConnectionId,
    /// Write half of the WebSocket (wrapped for sharing across tasks)
    write: Arc<Mutex<WsSink>>,
    /// Handle to the read task
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Wrap an upgraded stream and spawn its read task.
    pub fn new(
        id: ConnectionId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_task = tokio::spawn(async move {
            Self::read_loop(id, read, event_tx).await;
        });

        Self {
            id,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        id: ConnectionId,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data,
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from connection {}", id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Frame from connection {} exceeds max size ({} > {}), dropping",
                            id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    if event_tx
                        .send(ConnectionEvent::Message { conn: id, data })
                        .is_err()
                    {
                        // Server is gone
                        return;
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", id);
                        }
                        _ => {
                            error!("WebSocket error on connection {}: {}", id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn: id });
    }

    /// Send one protocol envelope as a text frame.
    pub async fn send(&self, json: &[u8]) -> Result<()> {
        let text = String::from_utf8(json.to_vec())
            .map_err(|e| anyhow!("Envelope is not valid UTF-8: {}", e))?;
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Send a close frame and stop reading.
    pub async fn close(&mut self) {
        {
            let mut write = self.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
        }

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
