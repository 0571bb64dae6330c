//! End-to-end tests for lfcc-server.
//!
//! Runs the daemon on a random port and drives it over real WebSocket
//! connections, using the core client state machine to speak the protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lfcc_core::clock::now_ms;
use lfcc_core::compaction::{MemoryStore, UpdateStore};
use lfcc_core::policy::PolicyManifestV09;
use lfcc_core::protocol::{Envelope, ErrorCode, Message as LfccMessage};
use lfcc_core::{ClientConfig, ClientOutput, ConnectionState, CrdtRuntime, LoroRuntime, SyncClient};
use lfcc_server::{Daemon, FileStore, ServerConfig, WebSocketServer};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const DOC: &str = "shared-notes";
const WAIT: Duration = Duration::from_secs(5);

/// Test client that connects to the daemon.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    client: SyncClient,
    replica: LoroRuntime,
    errors: Vec<ErrorCode>,
}

impl TestClient {
    /// Connect and run the handshake until the client settles.
    async fn connect(addr: SocketAddr, name: &str, peer_id: u64) -> Self {
        Self::connect_with_manifest(addr, name, peer_id, PolicyManifestV09::default()).await
    }

    async fn connect_with_manifest(
        addr: SocketAddr,
        name: &str,
        peer_id: u64,
        manifest: PolicyManifestV09,
    ) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");

        let mut client = Self {
            ws,
            client: SyncClient::new(ClientConfig {
                doc_id: DOC.into(),
                client_id: name.into(),
                manifest,
                ..Default::default()
            }),
            replica: LoroRuntime::with_peer_id(peer_id).unwrap(),
            errors: Vec::new(),
        };

        client.client.connect(now_ms());
        let outputs = client.client.on_open(now_ms());
        client.absorb(outputs).await;
        client
            .pump_until(|c| {
                matches!(
                    c.client.state(),
                    ConnectionState::Synced | ConnectionState::Closed
                )
            })
            .await;
        client
    }

    /// Perform client outputs: send frames, apply remote updates.
    async fn absorb(&mut self, outputs: Vec<ClientOutput>) {
        for output in outputs {
            match output {
                ClientOutput::Send(envelope) => self.send_envelope(&envelope).await,
                ClientOutput::Apply { data, .. } => self.replica.import(&data).unwrap(),
                ClientOutput::Fatal(error) => self.errors.push(error.code),
                _ => {}
            }
        }
    }

    /// Feed incoming frames to the client until `done` holds.
    async fn pump_until(&mut self, done: impl Fn(&Self) -> bool) {
        while !done(self) {
            let frame = self.recv_message_timeout(WAIT).await.expect("Timed out waiting for server");
            let outputs = self.client.on_message(&frame, now_ms());
            self.absorb(outputs).await;
        }
    }

    async fn type_text(&mut self, text: &str) {
        let parent = self.replica.frontier_tag();
        let before = self.replica.doc().oplog_vv();
        let body = self.replica.doc().get_text("body");
        body.insert(body.len_unicode(), text).unwrap();
        self.replica.doc().commit();
        let update = self
            .replica
            .doc()
            .export(loro::ExportMode::updates(&before))
            .unwrap();
        let outputs = self
            .client
            .enqueue_update(update, self.replica.frontier_tag(), parent, now_ms());
        self.absorb(outputs).await;
    }

    fn text(&self) -> String {
        self.replica.doc().get_text("body").to_string()
    }

    async fn send_envelope(&mut self, envelope: &Envelope) {
        let text = String::from_utf8(envelope.to_json().unwrap()).unwrap();
        self.send_text(&text).await;
    }

    async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("Failed to send message");
    }

    /// Receive the next data frame, or `None` once the server closed.
    async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.into_bytes()),
                Some(Ok(Message::Binary(data))) => return Some(data),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                _ => continue,
            }
        }
    }

    async fn recv_message(&mut self) -> Vec<u8> {
        self.recv_frame().await.expect("Connection closed unexpectedly")
    }

    /// Receive message with timeout.
    async fn recv_message_timeout(&mut self, duration: Duration) -> Result<Vec<u8>, &'static str> {
        match timeout(duration, self.recv_message()).await {
            Ok(msg) => Ok(msg),
            Err(_) => Err("Timeout waiting for message"),
        }
    }

    /// Close connection gracefully.
    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct RunningDaemon {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningDaemon {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.task.await.unwrap().unwrap();
    }
}

/// Start a daemon on a random port.
async fn start_daemon(store: Arc<dyn UpdateStore>) -> RunningDaemon {
    let listener = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = ServerConfig::default();
    config.engine.server_id = "test-server".into();
    config.tick_interval_ms = 50;

    let (shutdown, rx) = oneshot::channel::<()>();
    let daemon = Daemon::new(config, store);
    let task = tokio::spawn(daemon.run(listener, async move {
        let _ = rx.await;
    }));

    RunningDaemon { addr, shutdown, task }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_reaches_synced() {
    let daemon = start_daemon(Arc::new(MemoryStore::new())).await;

    let alice = TestClient::connect(daemon.addr, "alice", 1).await;
    assert_eq!(alice.client.state(), ConnectionState::Synced);
    assert!(alice.client.session_id().is_some());
    assert!(alice.errors.is_empty());

    alice.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_policy_mismatch_closes_connection() {
    let daemon = start_daemon(Arc::new(MemoryStore::new())).await;

    let mut manifest = PolicyManifestV09::default();
    manifest.anchor_encoding.version = "v2".into();
    let mut alice = TestClient::connect_with_manifest(daemon.addr, "alice", 1, manifest).await;

    assert_eq!(alice.client.state(), ConnectionState::Closed);
    assert_eq!(alice.errors, vec![ErrorCode::PolicyMismatch]);

    // The error precedes the close; nothing else arrives
    let next = timeout(WAIT, alice.recv_frame()).await.expect("Server did not close");
    assert!(next.is_none());

    daemon.stop().await;
}

#[tokio::test]
async fn test_garbage_frame_gets_invalid_message() {
    let daemon = start_daemon(Arc::new(MemoryStore::new())).await;

    let url = format!("ws://{}", daemon.addr);
    let (mut ws, _) = connect_async(&url).await.expect("Failed to connect");
    ws.send(Message::Text("not an envelope".into())).await.unwrap();

    let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let envelope = Envelope::from_json(&frame.into_data()).unwrap();
    let LfccMessage::Error(error) = &envelope.message else {
        panic!("Expected error, got {:?}", envelope.message);
    };
    assert_eq!(error.code, ErrorCode::InvalidMessage);

    daemon.stop().await;
}

// ============================================================================
// Updates
// ============================================================================

#[tokio::test]
async fn test_update_relayed_between_clients() {
    let store = Arc::new(MemoryStore::new());
    let daemon = start_daemon(store.clone()).await;

    let mut alice = TestClient::connect(daemon.addr, "alice", 1).await;
    let mut bob = TestClient::connect(daemon.addr, "bob", 2).await;

    alice.type_text("Hello").await;
    alice.pump_until(|c| c.client.unacked_count() == 0).await;
    bob.pump_until(|c| c.text() == "Hello").await;

    bob.type_text(", world").await;
    bob.pump_until(|c| c.client.unacked_count() == 0).await;
    alice.pump_until(|c| c.text() == "Hello, world").await;

    assert_eq!(store.get_updates(DOC).await.unwrap().len(), 2);

    alice.close().await;
    bob.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_updates_survive_restart() {
    let dir = TempDir::new().unwrap();

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let daemon = start_daemon(store).await;
    let mut alice = TestClient::connect(daemon.addr, "alice", 1).await;
    alice.type_text("persisted").await;
    alice.pump_until(|c| c.client.unacked_count() == 0).await;
    alice.close().await;
    daemon.stop().await;

    // A fresh server over the same directory serves the stored log
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let daemon = start_daemon(store).await;
    let bob = TestClient::connect(daemon.addr, "bob", 2).await;
    assert_eq!(bob.client.state(), ConnectionState::Synced);
    assert_eq!(bob.text(), "persisted");

    bob.close().await;
    daemon.stop().await;
}
