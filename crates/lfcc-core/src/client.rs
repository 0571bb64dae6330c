//! SyncClient: client side of the document sync protocol.
//!
//! Like the server engine this is sans-IO. The host owns the WebSocket and the
//! local CRDT document; it reports transport events and incoming frames, and
//! performs the returned [`ClientOutput`] actions.
//!
//! ```text
//! Connecting -> Handshaking -> CatchingUp -> Synced
//!                    ^              |          |
//!                    +-- Reconnecting <--------+
//! ```
//!
//! Local updates are queued until the connection is `Synced`. After a
//! reconnect the client always completes catch-up before sending updates.

use crate::crdt::FrontierTag;
use crate::diagnostics::ErrorLog;
use crate::divergence::{DivergenceBanner, DivergenceReason, DivergenceTracker};
use crate::events::{EventBus, LfccEvent};
use crate::policy::{manifest_hash, negotiated_policy_id, DegradedFeatures, PolicyManifestV09};
use crate::protocol::{
    Capabilities, CatchUpRequestPayload, DocUpdatePayload, Envelope, ErrorCode, ErrorPayload,
    HandshakeAckPayload, HandshakePayload, Message, PeerPresence, PingPayload, PongPayload,
    PresencePayload,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection lifecycle as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport is being opened
    Connecting,
    /// Handshake sent, awaiting ack
    Handshaking,
    /// Waiting for the catch-up response
    CatchingUp,
    /// Fully synced, updates flow
    Synced,
    /// Transport lost, waiting for the backoff delay
    Reconnecting,
    /// Closed by the user or by a fatal error
    Closed,
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomised in either direction.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). `jitter` is a sample in `[0, 1)`.
    pub fn delay(&self, attempt: u32, jitter: f64) -> u64 {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let spread = self.jitter_ratio.clamp(0.0, 1.0) * (2.0 * jitter.clamp(0.0, 1.0) - 1.0);
        let delayed = (exp as f64 * (1.0 + spread)).round() as u64;
        delayed.min(self.max_delay_ms)
    }

    fn next_delay(&self, attempt: u32) -> u64 {
        self.delay(attempt, rand::random::<f64>())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub doc_id: String,
    pub client_id: String,
    pub manifest: PolicyManifestV09,
    pub capabilities: Capabilities,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Consecutive `FRONTIER_CONFLICT`s before the divergence banner is raised.
    pub frontier_conflict_threshold: u32,
    pub prefer_snapshot: bool,
    pub max_update_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            doc_id: String::new(),
            client_id: uuid::Uuid::new_v4().to_string(),
            manifest: PolicyManifestV09::default(),
            capabilities: Capabilities {
                features: vec!["presence".into()],
                max_update_bytes: None,
            },
            ping_interval_ms: 15_000,
            pong_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            frontier_conflict_threshold: 3,
            prefer_snapshot: false,
            max_update_bytes: 1024 * 1024,
        }
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutput {
    /// Send this envelope over the transport.
    Send(Envelope),
    /// Import these bytes (snapshot, delta or relayed update) into the local document.
    Apply { data: Vec<u8>, frontier_tag: FrontierTag },
    /// Negotiation succeeded; show `degraded` to the user if non-empty.
    Negotiated {
        effective_manifest: PolicyManifestV09,
        degraded: DegradedFeatures,
    },
    /// Another client's presence changed.
    PeerPresence(PeerPresence),
    /// Full list of live peers.
    Peers(Vec<PeerPresence>),
    /// Drop the transport and reopen it after `delay_ms`.
    Reconnect { delay_ms: u64 },
    /// Call [`SyncClient::flush`] again after `delay_ms`.
    ScheduleFlush { delay_ms: u64 },
    /// Needs user-visible handling; never retried automatically.
    Fatal(ErrorPayload),
    /// Recovery banner; local edits are kept.
    Divergence(DivergenceBanner),
}

#[derive(Debug, Clone, PartialEq)]
struct PendingUpdate {
    update: Vec<u8>,
    frontier_tag: FrontierTag,
    parent_frontier_tag: FrontierTag,
}

pub struct SyncClient {
    config: ClientConfig,
    state: ConnectionState,
    session_id: Option<String>,
    effective_manifest: Option<PolicyManifestV09>,
    last_acked_frontier: Option<FrontierTag>,
    out_seq: u64,
    pending: VecDeque<PendingUpdate>,
    in_flight: BTreeMap<u64, PendingUpdate>,
    attempt: u32,
    last_ping_at: u64,
    awaiting_pong_since: Option<u64>,
    conflicts: DivergenceTracker,
    errors: ErrorLog,
    events: Option<Arc<EventBus>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            conflicts: DivergenceTracker::new(config.frontier_conflict_threshold),
            config,
            state: ConnectionState::Closed,
            session_id: None,
            effective_manifest: None,
            last_acked_frontier: None,
            out_seq: 0,
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            attempt: 0,
            last_ping_at: 0,
            awaiting_pong_since: None,
            errors: ErrorLog::default(),
            events: None,
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Resume from a frontier persisted by an earlier session.
    pub fn with_last_frontier(mut self, frontier: FrontierTag) -> Self {
        self.last_acked_frontier = Some(frontier);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn effective_manifest(&self) -> Option<&PolicyManifestV09> {
        self.effective_manifest.as_ref()
    }

    pub fn last_acked_frontier(&self) -> Option<&FrontierTag> {
        self.last_acked_frontier.as_ref()
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Updates not yet acknowledged by the server (queued or in flight).
    pub fn unacked_count(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    /// The host is opening the transport.
    pub fn connect(&mut self, now: u64) {
        self.set_state(ConnectionState::Connecting, now);
    }

    /// Transport is open: start the handshake.
    pub fn on_open(&mut self, now: u64) -> Vec<ClientOutput> {
        self.session_id = None;
        self.awaiting_pong_since = None;
        self.last_ping_at = now;
        let client_manifest_hash = match manifest_hash(&self.config.manifest) {
            Ok(hash) => hash,
            Err(e) => {
                let error = ErrorPayload::new(
                    ErrorCode::InternalError,
                    format!("Manifest could not be encoded: {e}"),
                );
                self.errors.record(now, &error);
                self.set_state(ConnectionState::Closed, now);
                return vec![ClientOutput::Fatal(error)];
            }
        };
        self.set_state(ConnectionState::Handshaking, now);
        let handshake = Message::Handshake(HandshakePayload {
            client_manifest: self.config.manifest.clone(),
            client_manifest_hash,
            capabilities: self.config.capabilities.clone(),
            last_frontier_tag: self.last_acked_frontier.clone(),
        });
        vec![self.send(handshake, now)]
    }

    /// Transport dropped. Unacked updates are kept for the next session.
    pub fn on_disconnect(&mut self, now: u64) -> Vec<ClientOutput> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        self.requeue_in_flight();
        self.session_id = None;
        self.awaiting_pong_since = None;
        self.set_state(ConnectionState::Reconnecting, now);
        let delay_ms = self.config.retry.next_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        info!("Reconnecting to {} in {}ms", self.config.doc_id, delay_ms);
        vec![ClientOutput::Reconnect { delay_ms }]
    }

    /// Stop syncing. Unacked updates stay queued.
    pub fn close(&mut self, now: u64) {
        self.requeue_in_flight();
        self.set_state(ConnectionState::Closed, now);
    }

    /// Queue a local update. It is sent immediately when synced.
    pub fn enqueue_update(
        &mut self,
        update: Vec<u8>,
        frontier_tag: FrontierTag,
        parent_frontier_tag: FrontierTag,
        now: u64,
    ) -> Vec<ClientOutput> {
        if update.len() > self.config.max_update_bytes {
            let error = ErrorPayload::new(
                ErrorCode::UpdateTooLarge,
                format!(
                    "Update of {} bytes exceeds {}",
                    update.len(),
                    self.config.max_update_bytes
                ),
            );
            self.errors.record(now, &error);
            return vec![ClientOutput::Fatal(error)];
        }
        self.pending.push_back(PendingUpdate {
            update,
            frontier_tag,
            parent_frontier_tag,
        });
        self.flush(now)
    }

    /// Send queued updates if synced.
    pub fn flush(&mut self, now: u64) -> Vec<ClientOutput> {
        if self.state != ConnectionState::Synced {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(pending) = self.pending.pop_front() {
            let message = Message::DocUpdate(DocUpdatePayload {
                update: pending.update.clone(),
                frontier_tag: pending.frontier_tag.clone(),
                parent_frontier_tag: pending.parent_frontier_tag.clone(),
            });
            out.push(self.send(message, now));
            self.in_flight.insert(self.out_seq, pending);
        }
        out
    }

    pub fn send_presence(&mut self, presence: PresencePayload, now: u64) -> Vec<ClientOutput> {
        match self.state {
            ConnectionState::CatchingUp | ConnectionState::Synced => {
                vec![self.send(Message::Presence(presence), now)]
            }
            _ => Vec::new(),
        }
    }

    /// Heartbeat: send pings and detect a silent server.
    pub fn tick(&mut self, now: u64) -> Vec<ClientOutput> {
        if !matches!(
            self.state,
            ConnectionState::CatchingUp | ConnectionState::Synced
        ) {
            return Vec::new();
        }
        if let Some(since) = self.awaiting_pong_since {
            if now.saturating_sub(since) > self.config.pong_timeout_ms {
                warn!("No pong from server within {}ms", self.config.pong_timeout_ms);
                return self.on_disconnect(now);
            }
            return Vec::new();
        }
        if now.saturating_sub(self.last_ping_at) >= self.config.ping_interval_ms {
            self.last_ping_at = now;
            self.awaiting_pong_since = Some(now);
            return vec![self.send(Message::Ping(PingPayload {}), now)];
        }
        Vec::new()
    }

    /// Process one frame from the server.
    pub fn on_message(&mut self, data: &[u8], now: u64) -> Vec<ClientOutput> {
        let envelope = match Envelope::from_json(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring invalid frame from server: {}", e);
                self.errors.record(now, &e.to_error_payload());
                return Vec::new();
            }
        };
        if envelope.doc_id != self.config.doc_id && envelope.doc_id != "-" {
            warn!("Ignoring frame for {}", envelope.doc_id);
            return Vec::new();
        }
        // Any traffic proves the server is alive.
        self.awaiting_pong_since = None;

        match envelope.message {
            Message::HandshakeAck(ack) => self.on_handshake_ack(ack, now),
            Message::CatchUpResponse(response) => {
                if self.state != ConnectionState::CatchingUp {
                    debug!("Unexpected catch_up_response in {:?}", self.state);
                }
                self.last_acked_frontier = Some(response.frontier_tag.clone());
                self.set_state(ConnectionState::Synced, now);
                let mut out = vec![ClientOutput::Apply {
                    data: response.data,
                    frontier_tag: response.frontier_tag,
                }];
                out.extend(self.flush(now));
                out
            }
            Message::DocUpdate(update) => {
                self.last_acked_frontier = Some(update.frontier_tag.clone());
                vec![ClientOutput::Apply {
                    data: update.update,
                    frontier_tag: update.frontier_tag,
                }]
            }
            Message::DocAck(ack) => {
                if self.in_flight.remove(&ack.acked_seq).is_none() {
                    debug!("Ack for unknown seq {}", ack.acked_seq);
                }
                self.last_acked_frontier = Some(ack.server_frontier_tag);
                self.conflicts.record(true);
                self.attempt = 0;
                Vec::new()
            }
            Message::Presence(presence) => vec![ClientOutput::PeerPresence(PeerPresence {
                client_id: envelope.client_id,
                presence,
                last_seen: envelope.timestamp,
            })],
            Message::PresenceAck(ack) => vec![ClientOutput::Peers(ack.peers)],
            Message::Ping(_) => {
                let pong = Message::Pong(PongPayload {
                    echo_timestamp: envelope.timestamp,
                });
                vec![self.send(pong, now)]
            }
            Message::Pong(_) => Vec::new(),
            Message::Error(error) => self.on_error(error, now),
            other @ (Message::Handshake(_) | Message::CatchUpRequest(_)) => {
                debug!("Ignoring client-only {} from server", other.message_type());
                Vec::new()
            }
        }
    }

    fn on_handshake_ack(&mut self, ack: HandshakeAckPayload, now: u64) -> Vec<ClientOutput> {
        if self.state != ConnectionState::Handshaking {
            debug!("Ignoring handshake_ack in {:?}", self.state);
            return Vec::new();
        }
        let consistent = matches!(
            (
                manifest_hash(&ack.effective_manifest),
                manifest_hash(&ack.server_manifest),
                negotiated_policy_id(&self.config.manifest, &ack.server_manifest),
            ),
            (Ok(chosen), Ok(server), Ok(policy))
                if chosen == ack.chosen_manifest_hash
                    && server == ack.server_manifest_hash
                    && policy == ack.effective_manifest.policy_id
        );
        if !consistent {
            let error = ErrorPayload::new(
                ErrorCode::InvalidMessage,
                "handshake_ack manifest hashes do not verify",
            );
            self.errors.record(now, &error);
            self.set_state(ConnectionState::Closed, now);
            return vec![ClientOutput::Fatal(error)];
        }

        info!(
            "Session {} on {} negotiated {}",
            ack.session_id, self.config.doc_id, ack.effective_manifest.policy_id
        );
        self.session_id = Some(ack.session_id);
        self.effective_manifest = Some(ack.effective_manifest.clone());
        self.attempt = 0;

        let mut out = vec![ClientOutput::Negotiated {
            effective_manifest: ack.effective_manifest,
            degraded: ack.degraded,
        }];
        if ack.needs_catch_up {
            out.extend(self.start_catch_up(now));
        } else {
            self.last_acked_frontier = Some(ack.server_frontier_tag);
            self.set_state(ConnectionState::Synced, now);
            out.extend(self.flush(now));
        }
        out
    }

    fn start_catch_up(&mut self, now: u64) -> Vec<ClientOutput> {
        self.set_state(ConnectionState::CatchingUp, now);
        let request = Message::CatchUpRequest(CatchUpRequestPayload {
            from_frontier_tag: self.last_acked_frontier.clone(),
            prefer_snapshot: self.config.prefer_snapshot,
        });
        vec![self.send(request, now)]
    }

    fn on_error(&mut self, error: ErrorPayload, now: u64) -> Vec<ClientOutput> {
        self.errors.record(now, &error);
        debug!("Server error {}: {}", error.code, error.message);

        match error.code {
            ErrorCode::FrontierConflict => {
                let mut out = Vec::new();
                if let Some(attempts) = self.conflicts.record(false) {
                    warn!("{} consecutive frontier conflicts on {}", attempts, self.config.doc_id);
                    let banner = DivergenceBanner::new(DivergenceReason::FrontierNonConvergence { attempts });
                    if let Some(events) = &self.events {
                        events.emit(LfccEvent::DivergenceDetected {
                            banner: banner.clone(),
                            timestamp: now,
                        });
                    }
                    out.push(ClientOutput::Divergence(banner));
                }
                self.requeue_in_flight();
                out.extend(self.start_catch_up(now));
                out
            }
            ErrorCode::CatchUpRequired | ErrorCode::OutOfOrder => {
                self.requeue_in_flight();
                self.start_catch_up(now)
            }
            ErrorCode::RateLimited => {
                self.requeue_in_flight();
                // The server's hint is a floor; repeated refusals still back off.
                let backoff = self.config.retry.next_delay(self.attempt);
                self.attempt = self.attempt.saturating_add(1);
                let delay_ms = error.retry_after_ms.map_or(backoff, |hint| hint.max(backoff));
                vec![ClientOutput::ScheduleFlush { delay_ms }]
            }
            code if code.closes_connection() && code.retryable() => self.on_disconnect(now),
            code if code.retryable() => {
                self.requeue_in_flight();
                let delay_ms = self.config.retry.next_delay(self.attempt);
                self.attempt = self.attempt.saturating_add(1);
                vec![ClientOutput::ScheduleFlush { delay_ms }]
            }
            code => {
                if code.closes_connection() {
                    self.set_state(ConnectionState::Closed, now);
                }
                vec![ClientOutput::Fatal(error)]
            }
        }
    }

    fn requeue_in_flight(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for pending in in_flight.into_values().rev() {
            self.pending.push_front(pending);
        }
    }

    fn send(&mut self, message: Message, now: u64) -> ClientOutput {
        self.out_seq += 1;
        ClientOutput::Send(Envelope::new(
            self.config.doc_id.clone(),
            self.config.client_id.clone(),
            self.out_seq,
            now,
            message,
        ))
    }

    fn set_state(&mut self, to: ConnectionState, now: u64) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!("{} connection: {:?} -> {:?}", self.config.doc_id, from, to);
        if let Some(events) = &self.events {
            events.emit(LfccEvent::ConnectionStateChanged {
                doc_id: self.config.doc_id.clone(),
                from,
                to,
                timestamp: now,
            });
        }
    }
}
