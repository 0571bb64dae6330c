//! SyncEngine: server side of the document sync protocol.
//!
//! The engine is sans-IO. The host feeds it raw frames per connection and
//! periodic ticks, and performs the [`Outbound`] actions it returns. The
//! protocol works as follows:
//!
//! 1. The client sends `handshake` with its manifest and last frontier
//! 2. The server negotiates and answers `handshake_ack` (or `POLICY_MISMATCH`
//!    followed by a close), flagging `needsCatchUp` when the client is behind
//! 3. A client that is behind sends `catch_up_request` and receives a snapshot
//!    or a delta
//! 4. `doc_update` messages are applied in `seq` order per connection, acked,
//!    and relayed to every other connection on the document
//!
//! Every protocol error is sent to the client before any teardown.

use crate::compaction::{materialize, UpdateRecord, UpdateStore};
use crate::crdt::{CrdtRuntime, FrontierTag, LoroRuntime};
use crate::policy::{manifest_hash, negotiate_manifests, NegotiationError, PolicyManifestV09};
use crate::presence::{PresenceConfig, PresenceStore};
use crate::protocol::{
    Capabilities, CatchUpMode, CatchUpRequestPayload, CatchUpResponsePayload, DocAckPayload,
    DocUpdatePayload, Envelope, ErrorCode, ErrorPayload, HandshakeAckPayload, HandshakePayload,
    Message, PongPayload, PresenceAckPayload, PresencePayload,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub type ConnectionId = u64;

/// Token-bucket settings for `doc_update` traffic per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 50,
            per_second: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server_id: String,
    pub manifest: PolicyManifestV09,
    pub capabilities: Capabilities,
    pub max_update_bytes: usize,
    pub max_clients_per_doc: usize,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Catch-up sends a snapshot when the delta would span more stored updates.
    pub snapshot_threshold_updates: usize,
    pub rate_limit: RateLimitConfig,
    pub presence: PresenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_id: "lfcc-server".to_string(),
            manifest: PolicyManifestV09::default(),
            capabilities: Capabilities {
                features: vec!["presence".into(), "snapshots".into()],
                max_update_bytes: Some(1024 * 1024),
            },
            max_update_bytes: 1024 * 1024,
            max_clients_per_doc: 64,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            snapshot_threshold_updates: 50,
            rate_limit: RateLimitConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send {
        conn: ConnectionId,
        envelope: Envelope,
    },
    /// Close the transport. Always preceded by the error explaining why.
    Close { conn: ConnectionId, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHandshake,
    CatchingUp,
    Synced,
}

struct TokenBucket {
    tokens: f64,
    last_refill: u64,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig, now: u64) -> Self {
        Self {
            tokens: config.burst as f64,
            last_refill: now,
        }
    }

    /// Take one token, or return how long until one is available.
    fn try_take(&mut self, config: &RateLimitConfig, now: u64) -> Result<(), u64> {
        let elapsed = now.saturating_sub(self.last_refill) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * config.per_second).min(config.burst as f64);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if config.per_second <= 0.0 {
            return Err(u64::MAX);
        }
        Err((((1.0 - self.tokens) / config.per_second) * 1000.0).ceil() as u64)
    }
}

struct Session {
    doc_id: String,
    client_id: String,
    session_id: String,
    effective_manifest: PolicyManifestV09,
}

struct Connection {
    phase: Phase,
    opened_at: u64,
    last_seen: u64,
    session: Option<Session>,
    last_update_seq: Option<u64>,
    bucket: TokenBucket,
    out_seq: u64,
}

struct Room {
    runtime: Box<dyn CrdtRuntime>,
    connections: BTreeSet<ConnectionId>,
    next_update_seq: u64,
}

/// Server-side protocol state for all connections and open documents.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn UpdateStore>,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, Room>,
    presence: PresenceStore,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn UpdateStore>) -> Self {
        let presence = PresenceStore::new(&config.presence);
        Self {
            config,
            store,
            connections: HashMap::new(),
            rooms: HashMap::new(),
            presence,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a new transport connection.
    pub fn open(&mut self, conn: ConnectionId, now: u64) {
        self.connections.insert(
            conn,
            Connection {
                phase: Phase::AwaitingHandshake,
                opened_at: now,
                last_seen: now,
                session: None,
                last_update_seq: None,
                bucket: TokenBucket::new(&self.config.rate_limit, now),
                out_seq: 0,
            },
        );
        debug!("Connection {} opened", conn);
    }

    /// Forget a connection. Idempotent.
    pub fn close(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        if let Some(session) = connection.session {
            self.presence.remove(&session.doc_id, &session.client_id);
            if let Some(room) = self.rooms.get_mut(&session.doc_id) {
                room.connections.remove(&conn);
                if room.connections.is_empty() {
                    self.rooms.remove(&session.doc_id);
                    debug!("Closed room {}", session.doc_id);
                }
            }
        }
        debug!("Connection {} closed", conn);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Documents with at least one connected client.
    pub fn active_docs(&self) -> Vec<String> {
        let mut docs: Vec<String> = self.rooms.keys().cloned().collect();
        docs.sort();
        docs
    }

    /// Current in-memory frontier of an open document.
    pub fn doc_frontier(&self, doc_id: &str) -> Option<FrontierTag> {
        self.rooms.get(doc_id).map(|r| r.runtime.frontier_tag())
    }

    /// Process one incoming frame.
    pub async fn handle(&mut self, conn: ConnectionId, data: &[u8], now: u64) -> Vec<Outbound> {
        let Some(connection) = self.connections.get_mut(&conn) else {
            warn!("Frame for unknown connection {}", conn);
            return Vec::new();
        };
        connection.last_seen = now;
        let phase = connection.phase;

        let envelope = match Envelope::from_json(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Rejecting invalid message on {}: {}", conn, e);
                let payload = e.to_error_payload();
                return self.error_out(conn, payload, now);
            }
        };

        if phase == Phase::AwaitingHandshake {
            return match envelope.message {
                Message::Handshake(payload) => {
                    self.on_handshake(conn, &envelope.doc_id, &envelope.client_id, payload, now)
                        .await
                }
                _ => self.error_out(
                    conn,
                    ErrorPayload::new(ErrorCode::HandshakeRequired, "Send handshake first"),
                    now,
                ),
            };
        }

        let session_doc = self.session(conn).map(|s| s.doc_id.clone());
        if session_doc.as_deref() != Some(envelope.doc_id.as_str()) {
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::InvalidMessage, "docId does not match session"),
                now,
            );
        }

        match envelope.message {
            Message::Handshake(_) => self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::InvalidMessage, "Session already negotiated"),
                now,
            ),
            Message::CatchUpRequest(payload) => self.on_catch_up(conn, payload, now).await,
            Message::DocUpdate(payload) => {
                self.on_doc_update(conn, envelope.seq, payload, now).await
            }
            Message::Presence(payload) => self.on_presence(conn, payload, now),
            Message::Ping(_) => {
                let pong = Message::Pong(PongPayload {
                    echo_timestamp: envelope.timestamp,
                });
                vec![self.send(conn, pong, now)]
            }
            Message::Pong(_) => Vec::new(),
            Message::Error(payload) => {
                debug!("Client on {} reported {}: {}", conn, payload.code, payload.message);
                Vec::new()
            }
            Message::HandshakeAck(_)
            | Message::DocAck(_)
            | Message::PresenceAck(_)
            | Message::CatchUpResponse(_) => self.error_out(
                conn,
                ErrorPayload::new(
                    ErrorCode::InvalidMessage,
                    format!("{} is server-only", envelope.message.message_type()),
                ),
                now,
            ),
        }
    }

    /// Enforce handshake/idle timeouts and expire stale presences.
    pub fn tick(&mut self, now: u64) -> Vec<Outbound> {
        let mut expired = Vec::new();
        for (conn, connection) in &self.connections {
            if connection.phase == Phase::AwaitingHandshake
                && now.saturating_sub(connection.opened_at) > self.config.handshake_timeout_ms
            {
                expired.push((*conn, ErrorCode::HandshakeTimeout));
            } else if now.saturating_sub(connection.last_seen) > self.config.idle_timeout_ms {
                expired.push((*conn, ErrorCode::IdleTimeout));
            }
        }
        expired.sort_by_key(|(conn, _)| *conn);

        let mut out = Vec::new();
        for (conn, code) in expired {
            info!("Closing connection {}: {}", conn, code);
            out.extend(self.error_out(conn, ErrorPayload::new(code, code.as_str()), now));
        }

        for (doc_id, client_id) in self.presence.sweep_stale(now) {
            debug!("Presence of {} on {} expired", client_id, doc_id);
        }
        out
    }

    async fn on_handshake(
        &mut self,
        conn: ConnectionId,
        doc_id: &str,
        client_id: &str,
        payload: HandshakePayload,
        now: u64,
    ) -> Vec<Outbound> {
        if !manifest_hash(&payload.client_manifest).is_ok_and(|h| h == payload.client_manifest_hash) {
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::InvalidMessage, "clientManifestHash does not match"),
                now,
            );
        }

        let negotiated = match negotiate_manifests(&payload.client_manifest, &self.config.manifest) {
            Ok(negotiated) => negotiated,
            Err(NegotiationError::Encoding(e)) => {
                error!("Failed to encode negotiated manifest for {}: {}", client_id, e);
                return self.error_out(
                    conn,
                    ErrorPayload::new(ErrorCode::InternalError, "Manifest could not be encoded"),
                    now,
                );
            }
            Err(e) => {
                info!("Negotiation with {} failed: {}", client_id, e);
                return self.error_out(
                    conn,
                    ErrorPayload::new(ErrorCode::PolicyMismatch, e.to_string()),
                    now,
                );
            }
        };

        let hashes = manifest_hash(&self.config.manifest)
            .and_then(|server| Ok((server, manifest_hash(&negotiated.effective_manifest)?)));
        let (server_manifest_hash, chosen_manifest_hash) = match hashes {
            Ok(hashes) => hashes,
            Err(e) => {
                error!("Failed to hash manifests for {}: {}", client_id, e);
                return self.error_out(
                    conn,
                    ErrorPayload::new(ErrorCode::InternalError, "Manifest could not be encoded"),
                    now,
                );
            }
        };

        if let Err(payload) = self.join_room(conn, doc_id).await {
            return self.error_out(conn, payload, now);
        }

        let Some(room) = self.rooms.get(doc_id) else {
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::InternalError, "Document unavailable"),
                now,
            );
        };
        let needs_catch_up = !room.runtime.is_caught_up(payload.last_frontier_tag.as_ref());
        let server_frontier_tag = room.runtime.frontier_tag();

        let session_id = uuid::Uuid::new_v4().to_string();
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.phase = if needs_catch_up {
                Phase::CatchingUp
            } else {
                Phase::Synced
            };
            connection.session = Some(Session {
                doc_id: doc_id.to_string(),
                client_id: client_id.to_string(),
                session_id: session_id.clone(),
                effective_manifest: negotiated.effective_manifest.clone(),
            });
        }
        info!(
            "Client {} joined {} (session {}, catch-up: {})",
            client_id, doc_id, session_id, needs_catch_up
        );

        let ack = Message::HandshakeAck(HandshakeAckPayload {
            server_manifest: self.config.manifest.clone(),
            server_manifest_hash,
            chosen_manifest_hash,
            effective_manifest: negotiated.effective_manifest,
            session_id,
            needs_catch_up,
            server_frontier_tag,
            degraded: negotiated.degraded,
            server_capabilities: self.config.capabilities.clone(),
        });
        vec![self.send(conn, ack, now)]
    }

    /// Load the document if needed and add the connection to it.
    async fn join_room(&mut self, conn: ConnectionId, doc_id: &str) -> Result<(), ErrorPayload> {
        if let Some(room) = self.rooms.get_mut(doc_id) {
            if room.connections.len() >= self.config.max_clients_per_doc {
                return Err(ErrorPayload::new(ErrorCode::RoomFull, "Document has too many clients"));
            }
            room.connections.insert(conn);
            return Ok(());
        }
        if self.config.max_clients_per_doc == 0 {
            return Err(ErrorPayload::new(ErrorCode::RoomFull, "Document has too many clients"));
        }

        let (runtime, last_seq) = self.load_runtime(doc_id).await.map_err(|e| {
            error!("Failed to load {}: {}", doc_id, e);
            ErrorPayload::new(ErrorCode::InternalError, "Failed to load document")
        })?;
        self.rooms.insert(
            doc_id.to_string(),
            Room {
                runtime: Box::new(runtime),
                connections: BTreeSet::from([conn]),
                next_update_seq: last_seq + 1,
            },
        );
        Ok(())
    }

    /// Materialize a document from the store, with the highest stored update seq.
    async fn load_runtime(&self, doc_id: &str) -> Result<(LoroRuntime, u64), String> {
        let snapshot = self
            .store
            .get_latest_snapshot(doc_id)
            .await
            .map_err(|e| e.to_string())?;
        let updates = self.store.get_updates(doc_id).await.map_err(|e| e.to_string())?;
        let runtime = materialize(snapshot.as_ref(), &updates).map_err(|e| e.to_string())?;

        let last_seq = updates
            .last()
            .map(|u| u.seq)
            .into_iter()
            .chain(snapshot.as_ref().map(|s| s.through_update_seq))
            .max()
            .unwrap_or(0);
        debug!(
            "Loaded {} ({} stored updates, snapshot: {})",
            doc_id,
            updates.len(),
            snapshot.is_some()
        );
        Ok((runtime, last_seq))
    }

    /// Rebuild a loaded room from the store, discarding in-memory state.
    ///
    /// When the store cannot be read either, the room is dropped and its
    /// connections are closed so that they reconnect against a fresh load.
    async fn reload_room(&mut self, doc_id: &str, now: u64) -> Vec<Outbound> {
        let loaded = self.load_runtime(doc_id).await;
        match loaded {
            Ok((runtime, last_seq)) => {
                if let Some(room) = self.rooms.get_mut(doc_id) {
                    room.runtime = Box::new(runtime);
                    room.next_update_seq = last_seq + 1;
                }
                Vec::new()
            }
            Err(e) => {
                error!("Failed to reload {}: {}; dropping room", doc_id, e);
                let members: Vec<ConnectionId> = self
                    .rooms
                    .get(doc_id)
                    .map(|r| r.connections.iter().copied().collect())
                    .unwrap_or_default();
                let mut out = Vec::with_capacity(members.len() * 2);
                for member in members {
                    out.push(self.send(
                        member,
                        Message::Error(ErrorPayload::new(ErrorCode::InternalError, "Document state lost")),
                        now,
                    ));
                    out.push(Outbound::Close {
                        conn: member,
                        reason: ErrorCode::InternalError.as_str().to_string(),
                    });
                    self.close(member);
                }
                self.rooms.remove(doc_id);
                out
            }
        }
    }

    async fn on_catch_up(
        &mut self,
        conn: ConnectionId,
        request: CatchUpRequestPayload,
        now: u64,
    ) -> Vec<Outbound> {
        let Some(doc_id) = self.session(conn).map(|s| s.doc_id.clone()) else {
            return Vec::new();
        };
        let updates = match self.store.get_updates(&doc_id).await {
            Ok(updates) => updates,
            Err(e) => {
                error!("Catch-up for {} failed to read updates: {}", doc_id, e);
                return self.error_out(
                    conn,
                    ErrorPayload::new(ErrorCode::InternalError, "Catch-up failed"),
                    now,
                );
            }
        };
        let Some(room) = self.rooms.get(&doc_id) else {
            return Vec::new();
        };

        let delta_count = request.from_frontier_tag.as_ref().and_then(|from| {
            if from.is_empty() {
                return Some(updates.len());
            }
            updates
                .iter()
                .position(|u| &u.frontier_tag == from)
                .map(|i| updates.len() - i - 1)
        });
        let use_snapshot = request.prefer_snapshot
            || delta_count.is_none_or(|n| n > self.config.snapshot_threshold_updates);

        let built = if use_snapshot {
            room.runtime
                .export_snapshot()
                .map(|data| (CatchUpMode::Snapshot, data, 0))
        } else {
            room.runtime
                .export_since(request.from_frontier_tag.as_ref())
                .map(|data| (CatchUpMode::Updates, data, delta_count.unwrap_or(0)))
        };
        let (mode, data, update_count) = match built {
            Ok(built) => built,
            Err(e) => {
                error!("Catch-up export for {} failed: {}", doc_id, e);
                return self.error_out(
                    conn,
                    ErrorPayload::new(ErrorCode::InternalError, "Catch-up failed"),
                    now,
                );
            }
        };
        let frontier_tag = room.runtime.frontier_tag();
        debug!(
            "Catch-up for {} on {}: {:?}, {} bytes",
            conn,
            doc_id,
            mode,
            data.len()
        );

        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.phase = Phase::Synced;
        }
        let response = Message::CatchUpResponse(CatchUpResponsePayload {
            mode,
            data,
            frontier_tag,
            update_count,
        });
        vec![self.send(conn, response, now)]
    }

    async fn on_doc_update(
        &mut self,
        conn: ConnectionId,
        seq: u64,
        update: DocUpdatePayload,
        now: u64,
    ) -> Vec<Outbound> {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return Vec::new();
        };
        if connection.phase == Phase::CatchingUp {
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::CatchUpRequired, "Catch up before sending updates"),
                now,
            );
        }
        if let Err(retry_after) = connection.bucket.try_take(&self.config.rate_limit, now) {
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::RateLimited, "Too many updates").with_retry_after(retry_after),
                now,
            );
        }
        if update.update.len() > self.config.max_update_bytes {
            return self.error_out(
                conn,
                ErrorPayload::new(
                    ErrorCode::UpdateTooLarge,
                    format!(
                        "Update of {} bytes exceeds {}",
                        update.update.len(),
                        self.config.max_update_bytes
                    ),
                ),
                now,
            );
        }
        if connection.last_update_seq.is_some_and(|last| seq <= last) {
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::OutOfOrder, format!("seq {seq} already seen")),
                now,
            );
        }
        let Some((doc_id, client_id)) = connection
            .session
            .as_ref()
            .map(|s| (s.doc_id.clone(), s.client_id.clone()))
        else {
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&doc_id) else {
            return Vec::new();
        };

        if !update.parent_frontier_tag.is_empty()
            && !room.runtime.knows_frontier(&update.parent_frontier_tag)
        {
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::FrontierConflict, "Parent frontier unknown; catch up first"),
                now,
            );
        }

        if let Err(e) = room.runtime.import(&update.update) {
            debug!("Rejecting undecodable update from {}: {}", client_id, e);
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::InvalidMessage, "Update could not be applied"),
                now,
            );
        }
        let server_frontier_tag = room.runtime.frontier_tag();
        let record_seq = room.next_update_seq;
        room.next_update_seq += 1;
        let peers: Vec<ConnectionId> = room
            .connections
            .iter()
            .copied()
            .filter(|c| *c != conn)
            .collect();

        let record = UpdateRecord {
            seq: record_seq,
            data: update.update.clone(),
            frontier_tag: server_frontier_tag.clone(),
            parent_frontier_tag: update.parent_frontier_tag.clone(),
            client_id: client_id.clone(),
            created_at: now,
        };
        if let Err(e) = self.store.append_update(&doc_id, record).await {
            error!("Failed to persist update {} for {}: {}", record_seq, doc_id, e);
            // The room already holds the update; bring it back in line with the log.
            let dropped = self.reload_room(&doc_id, now).await;
            if !dropped.is_empty() {
                return dropped;
            }
            return self.error_out(
                conn,
                ErrorPayload::new(ErrorCode::InternalError, "Update could not be persisted"),
                now,
            );
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.last_update_seq = Some(seq);
        }

        let mut out = Vec::with_capacity(peers.len() + 1);
        for peer in peers {
            let synced = self
                .connections
                .get(&peer)
                .is_some_and(|c| c.phase == Phase::Synced);
            if !synced {
                // Catching-up peers get this through their catch-up response.
                continue;
            }
            let relay = Message::DocUpdate(DocUpdatePayload {
                update: update.update.clone(),
                frontier_tag: server_frontier_tag.clone(),
                parent_frontier_tag: update.parent_frontier_tag.clone(),
            });
            out.push(self.send_as(peer, &client_id, relay, now));
        }

        let ack = Message::DocAck(DocAckPayload {
            acked_seq: seq,
            server_frontier_tag,
            applied: true,
        });
        out.push(self.send(conn, ack, now));
        out
    }

    fn on_presence(&mut self, conn: ConnectionId, presence: PresencePayload, now: u64) -> Vec<Outbound> {
        let Some((doc_id, client_id)) = self
            .session(conn)
            .map(|s| (s.doc_id.clone(), s.client_id.clone()))
        else {
            return Vec::new();
        };
        self.presence.update(&doc_id, &client_id, presence.clone(), now);

        let peers: Vec<ConnectionId> = self
            .rooms
            .get(&doc_id)
            .map(|r| r.connections.iter().copied().filter(|c| *c != conn).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(peers.len() + 1);
        for peer in peers {
            out.push(self.send_as(peer, &client_id, Message::Presence(presence.clone()), now));
        }
        let ack = Message::PresenceAck(PresenceAckPayload {
            peers: self.presence.peers(&doc_id, Some(&client_id)),
        });
        out.push(self.send(conn, ack, now));
        out
    }

    fn session(&self, conn: ConnectionId) -> Option<&Session> {
        self.connections.get(&conn).and_then(|c| c.session.as_ref())
    }

    /// Negotiated manifest of a connection's session.
    pub fn effective_manifest(&self, conn: ConnectionId) -> Option<&PolicyManifestV09> {
        self.session(conn).map(|s| &s.effective_manifest)
    }

    /// Session id handed out in the connection's `handshake_ack`.
    pub fn session_id(&self, conn: ConnectionId) -> Option<&str> {
        self.session(conn).map(|s| s.session_id.as_str())
    }

    fn send(&mut self, conn: ConnectionId, message: Message, now: u64) -> Outbound {
        let server_id = self.config.server_id.clone();
        self.send_as(conn, &server_id, message, now)
    }

    fn send_as(&mut self, conn: ConnectionId, sender: &str, message: Message, now: u64) -> Outbound {
        let (doc_id, seq) = match self.connections.get_mut(&conn) {
            Some(connection) => {
                connection.out_seq += 1;
                let doc_id = connection
                    .session
                    .as_ref()
                    .map(|s| s.doc_id.clone())
                    .unwrap_or_else(|| "-".to_string());
                (doc_id, connection.out_seq)
            }
            None => ("-".to_string(), 0),
        };
        Outbound::Send {
            conn,
            envelope: Envelope::new(doc_id, sender, seq, now, message),
        }
    }

    /// Send an error, then close and forget the connection if the code demands it.
    fn error_out(&mut self, conn: ConnectionId, payload: ErrorPayload, now: u64) -> Vec<Outbound> {
        let code = payload.code;
        let mut out = vec![self.send(conn, Message::Error(payload), now)];
        if code.closes_connection() {
            out.push(Outbound::Close {
                conn,
                reason: code.as_str().to_string(),
            });
            self.close(conn);
        }
        out
    }
}
