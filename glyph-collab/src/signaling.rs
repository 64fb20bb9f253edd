//! Call signaling: pairs two peers under a call id and relays opaque
//! offer/answer/candidate payloads between them.
//!
//! ```text
//!            offer            answer
//! NoSession ───────► Offered ───────► Answered
//!                       │  ▲             │
//!                       │  └─ re-offer ──┘  (same pair only)
//!                       │                │
//!                       └──► Closed ◄────┘  hangup / cancel / reject / disconnect
//! ```
//!
//! A closed session is forgotten, so its call id can start a new call.
//! Payloads are never inspected. Delivery uses bounded per-peer channels
//! and never blocks the relay: a full or missing endpoint yields
//! [`RelayOutcome::Undelivered`].

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::operation::{ConnectionId, PeerId};

pub type CallId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Hangup,
    /// Caller gives up before an answer
    Cancel,
    /// Callee declines
    Reject,
}

impl SignalKind {
    fn closes_call(self) -> bool {
        matches!(self, SignalKind::Hangup | SignalKind::Cancel | SignalKind::Reject)
    }
}

/// Signaling envelope. `payload` is relayed byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub call_id: CallId,
    pub kind: SignalKind,
    pub from: PeerId,
    /// Required on offers; filled in by the relay on delivery
    pub to: Option<PeerId>,
    pub payload: String,
}

impl SignalMessage {
    pub fn new(call_id: impl Into<CallId>, kind: SignalKind, from: PeerId, payload: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            kind,
            from,
            to: None,
            payload: payload.into(),
        }
    }

    pub fn to(mut self, peer: PeerId) -> Self {
        self.to = Some(peer);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Offered,
    Answered,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No live session for the call id
    UnknownCall,
    /// Same candidate already relayed for this call
    DuplicateCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Relayed { to: PeerId, state: CallState },
    /// Session updated, but the counterpart's endpoint is gone or full
    Undelivered { to: PeerId, state: CallState },
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("call '{call_id}' belongs to a different pair of peers")]
    SessionConflict { call_id: CallId },
    #[error("offer for call '{call_id}' has no callee")]
    MissingCallee { call_id: CallId },
    #[error("peer cannot call itself (call '{call_id}')")]
    SelfCall { call_id: CallId },
    #[error("peer {peer} is not connected (call '{call_id}')")]
    PeerUnavailable { call_id: CallId, peer: PeerId },
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Messages buffered per connected peer (default: 64)
    pub endpoint_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint_capacity: 64,
        }
    }
}

impl SignalingConfig {
    pub fn for_testing() -> Self {
        Self { endpoint_capacity: 4 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalingStats {
    pub relayed: u64,
    pub undelivered: u64,
    pub dropped: u64,
    pub conflicts: u64,
}

#[derive(Default)]
struct AtomicSignalingStats {
    relayed: AtomicU64,
    undelivered: AtomicU64,
    dropped: AtomicU64,
    conflicts: AtomicU64,
}

struct CallSession {
    call_id: CallId,
    caller: PeerId,
    callee: PeerId,
    state: CallState,
    latest_offer: String,
    latest_answer: Option<String>,
    candidates: HashSet<(PeerId, String)>,
}

impl CallSession {
    fn counterpart(&self, peer: PeerId) -> Option<PeerId> {
        if peer == self.caller {
            Some(self.callee)
        } else if peer == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }

    fn is_pair(&self, a: PeerId, b: PeerId) -> bool {
        (a == self.caller && b == self.callee) || (a == self.callee && b == self.caller)
    }
}

struct Endpoint {
    connection: ConnectionId,
    tx: mpsc::Sender<SignalMessage>,
}

/// Routes signaling messages between connected peers.
pub struct SignalingRelay {
    endpoints: RwLock<HashMap<PeerId, Endpoint>>,
    calls: RwLock<HashMap<CallId, Arc<Mutex<CallSession>>>>,
    config: SignalingConfig,
    stats: AtomicSignalingStats,
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new(SignalingConfig::default())
    }
}

impl SignalingRelay {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            config,
            stats: AtomicSignalingStats::default(),
        }
    }

    /// Register a peer's endpoint for `connection`. A reconnect replaces
    /// the previous endpoint.
    pub async fn connect(&self, peer: PeerId, connection: ConnectionId) -> mpsc::Receiver<SignalMessage> {
        let (tx, rx) = mpsc::channel(self.config.endpoint_capacity);
        let endpoint = Endpoint { connection, tx };
        if let Some(previous) = self.endpoints.write().await.insert(peer, endpoint) {
            log::debug!(
                "Signaling endpoint for {peer} moved from connection {} to {connection}",
                previous.connection
            );
        }
        rx
    }

    /// Drop a peer's endpoint and close its calls, telling each counterpart.
    ///
    /// Ignored when the peer has reconnected since: the endpoint belongs to
    /// another connection and its calls stay up. Returns the number of
    /// calls closed.
    pub async fn disconnect(&self, peer: PeerId, connection: ConnectionId) -> usize {
        {
            let mut endpoints = self.endpoints.write().await;
            if let Some(current) = endpoints.get(&peer).map(|e| e.connection) {
                if current != connection {
                    log::debug!("Ignoring disconnect of {peer} from stale connection {connection}");
                    return 0;
                }
                endpoints.remove(&peer);
            }
        }

        let sessions: Vec<Arc<Mutex<CallSession>>> =
            self.calls.read().await.values().cloned().collect();

        let mut closed = 0;
        for session in sessions {
            let mut guard = session.lock().await;
            if guard.state == CallState::Closed {
                continue;
            }
            let Some(counterpart) = guard.counterpart(peer) else {
                continue;
            };
            guard.state = CallState::Closed;
            self.forget(&guard.call_id, &session).await;

            let hangup = SignalMessage::new(guard.call_id.clone(), SignalKind::Hangup, peer, "")
                .to(counterpart);
            self.deliver(counterpart, hangup, CallState::Closed).await;
            log::info!("Call '{}' closed: {peer} disconnected", guard.call_id);
            closed += 1;
        }
        closed
    }

    /// Route one message according to the call's state machine.
    pub async fn relay(&self, msg: SignalMessage) -> Result<RelayOutcome, SignalingError> {
        let result = match msg.kind {
            SignalKind::Offer => self.offer(msg).await,
            _ => self.in_call(msg).await,
        };

        match &result {
            Ok(RelayOutcome::Dropped(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(SignalingError::SessionConflict { .. }) => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        result
    }

    /// `None` means no live session.
    pub async fn call_state(&self, call_id: &str) -> Option<CallState> {
        let session = self.calls.read().await.get(call_id).cloned()?;
        let state = session.lock().await.state;
        Some(state)
    }

    /// Most recent offer and answer payloads of a live call.
    pub async fn negotiation(&self, call_id: &str) -> Option<(String, Option<String>)> {
        let session = self.calls.read().await.get(call_id).cloned()?;
        let guard = session.lock().await;
        Some((guard.latest_offer.clone(), guard.latest_answer.clone()))
    }

    pub async fn active_calls(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn is_connected(&self, peer: PeerId) -> bool {
        self.endpoints.read().await.contains_key(&peer)
    }

    pub fn stats(&self) -> SignalingStats {
        SignalingStats {
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            undelivered: self.stats.undelivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
        }
    }

    async fn offer(&self, msg: SignalMessage) -> Result<RelayOutcome, SignalingError> {
        let callee = msg.to.ok_or_else(|| SignalingError::MissingCallee {
            call_id: msg.call_id.clone(),
        })?;
        if callee == msg.from {
            return Err(SignalingError::SelfCall {
                call_id: msg.call_id.clone(),
            });
        }

        loop {
            let existing = self.calls.read().await.get(&msg.call_id).cloned();
            let Some(session) = existing else {
                if !self.is_connected(callee).await {
                    return Err(SignalingError::PeerUnavailable {
                        call_id: msg.call_id.clone(),
                        peer: callee,
                    });
                }

                let mut calls = self.calls.write().await;
                if calls.contains_key(&msg.call_id) {
                    // Another offer created it first
                    continue;
                }
                calls.insert(
                    msg.call_id.clone(),
                    Arc::new(Mutex::new(CallSession {
                        call_id: msg.call_id.clone(),
                        caller: msg.from,
                        callee,
                        state: CallState::Offered,
                        latest_offer: msg.payload.clone(),
                        latest_answer: None,
                        candidates: HashSet::new(),
                    })),
                );
                log::info!("Call '{}' offered: {} -> {callee}", msg.call_id, msg.from);
                // Delivered before releasing the map so nothing overtakes the offer
                return Ok(self.deliver(callee, msg, CallState::Offered).await);
            };

            let mut guard = session.lock().await;
            if guard.state == CallState::Closed {
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }
            if !guard.is_pair(msg.from, callee) {
                log::warn!(
                    "Offer for call '{}' from {} conflicts with the existing session",
                    msg.call_id,
                    msg.from
                );
                return Err(SignalingError::SessionConflict {
                    call_id: msg.call_id.clone(),
                });
            }

            // Renegotiation: keep only the latest offer and await a new answer
            guard.state = CallState::Offered;
            guard.latest_offer = msg.payload.clone();
            guard.latest_answer = None;
            return Ok(self.deliver(callee, msg, CallState::Offered).await);
        }
    }

    async fn in_call(&self, msg: SignalMessage) -> Result<RelayOutcome, SignalingError> {
        let Some(session) = self.calls.read().await.get(&msg.call_id).cloned() else {
            log::debug!("Dropping {:?} for unknown call '{}'", msg.kind, msg.call_id);
            return Ok(RelayOutcome::Dropped(DropReason::UnknownCall));
        };

        let mut guard = session.lock().await;
        if guard.state == CallState::Closed {
            return Ok(RelayOutcome::Dropped(DropReason::UnknownCall));
        }
        let Some(counterpart) = guard.counterpart(msg.from) else {
            return Err(SignalingError::SessionConflict {
                call_id: msg.call_id.clone(),
            });
        };

        match msg.kind {
            SignalKind::Answer => {
                if msg.from != guard.callee {
                    return Err(SignalingError::SessionConflict {
                        call_id: msg.call_id.clone(),
                    });
                }
                guard.state = CallState::Answered;
                guard.latest_answer = Some(msg.payload.clone());
                log::info!("Call '{}' answered", msg.call_id);
            }
            SignalKind::Candidate => {
                if !guard.candidates.insert((msg.from, msg.payload.clone())) {
                    return Ok(RelayOutcome::Dropped(DropReason::DuplicateCandidate));
                }
            }
            kind if kind.closes_call() => {
                guard.state = CallState::Closed;
                self.forget(&msg.call_id, &session).await;
                log::info!("Call '{}' closed by {:?} from {}", msg.call_id, kind, msg.from);
            }
            _ => {}
        }

        let state = guard.state;
        let msg = SignalMessage {
            to: Some(counterpart),
            ..msg
        };
        Ok(self.deliver(counterpart, msg, state).await)
    }

    async fn deliver(&self, to: PeerId, msg: SignalMessage, state: CallState) -> RelayOutcome {
        let endpoints = self.endpoints.read().await;
        let sent = match endpoints.get(&to) {
            Some(endpoint) => match endpoint.tx.try_send(msg) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Signaling endpoint of {to} unavailable: {e}");
                    false
                }
            },
            None => false,
        };

        if sent {
            self.stats.relayed.fetch_add(1, Ordering::Relaxed);
            RelayOutcome::Relayed { to, state }
        } else {
            self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
            RelayOutcome::Undelivered { to, state }
        }
    }

    async fn forget(&self, call_id: &str, session: &Arc<Mutex<CallSession>>) {
        let mut calls = self.calls.write().await;
        if calls.get(call_id).is_some_and(|current| Arc::ptr_eq(current, session)) {
            calls.remove(call_id);
        }
    }
}
