//! # Server State
//!
//! Holds the shared application state for the tunnel server:
//! - **Session directory**: maps subdomain labels to their control sessions
//! - **Per-session request registry**: maps request ids to pending requests
//!
//! The directory uses [`DashMap`] for concurrent access (read-mostly,
//! written on session open/close). Each pending request is a small state
//! machine mutated by its session's dispatch task; the public ingress only
//! creates it, waits on the resolver, and removes it on timeout.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use axum::http::StatusCode;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::ControlMessage;
use crate::rewrite::CompiledRules;
use crate::subdomain::{self, Allocation};

/// Type alias for the unbounded sender feeding a session's outbound
/// WebSocket queue.
pub type ClientTx = mpsc::UnboundedSender<ControlMessage>;

/// Capacity of the per-response chunk queue. A full queue suspends the
/// session's dispatch task, which is the backpressure path from the public
/// client back to the agent's chunk delivery rate.
const CHUNK_QUEUE: usize = 32;

/// Response data handed from the control channel to the waiting ingress.
pub struct AgentResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: AgentBody,
}

pub enum AgentBody {
    /// Complete body, from a bare `http_response_end`.
    Full(Bytes),
    /// Chunks arriving over the control channel.
    Stream(mpsc::Receiver<Bytes>),
}

/// What the single-shot resolver delivers to the ingress.
pub enum Resolution {
    /// The agent answered; run the response pipeline.
    Response(AgentResponse),
    /// The request terminated without an agent response. Delivered
    /// verbatim, bypassing the pipeline.
    Failed {
        status: StatusCode,
        message: &'static str,
    },
}

/// Outcome of `http_response_start` for a pending request.
#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// Stream opened; the ingress is now forwarding chunks.
    Opened,
    /// The public client disconnected before the response began.
    ClientGone,
    /// A response was already started or finished for this id.
    Duplicate,
}

/// State consumed by `http_response_end` handling.
pub enum TakenState {
    Awaiting(oneshot::Sender<Resolution>),
    Streaming(mpsc::Sender<Bytes>),
    Done,
}

enum PendingState {
    /// Waiting for `http_response_start` (or a bare `http_response_end`).
    Awaiting(oneshot::Sender<Resolution>),
    /// Body chunks are flowing to the public client.
    Streaming(mpsc::Sender<Bytes>),
    /// Resolver fired; nothing more is accepted.
    Done,
}

/// An in-flight public request awaiting the agent.
///
/// The resolver fires exactly once over the lifetime: on stream open, on a
/// bare response end, or on failure. After `Done`, chunks are dropped by
/// the caller (`chunk_sender` returns `None`).
pub struct PendingRequest {
    created_at: Instant,
    state: Mutex<PendingState>,
}

impl PendingRequest {
    pub fn new(resolver: oneshot::Sender<Resolution>) -> Self {
        Self {
            created_at: Instant::now(),
            state: Mutex::new(PendingState::Awaiting(resolver)),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True while no response has started. Used by the ingress to decide
    /// whether an abandoned entry is still its to remove.
    pub fn is_awaiting(&self) -> bool {
        matches!(*self.state.lock().unwrap(), PendingState::Awaiting(_))
    }

    /// Handles `http_response_start`: opens the body stream and resolves
    /// the waiting ingress with a streaming response.
    pub fn start(&self, status: u16, headers: HashMap<String, String>) -> StartOutcome {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, PendingState::Done) {
            PendingState::Awaiting(resolver) => {
                let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
                let response = AgentResponse {
                    status,
                    headers,
                    body: AgentBody::Stream(chunk_rx),
                };
                if resolver.send(Resolution::Response(response)).is_ok() {
                    *state = PendingState::Streaming(chunk_tx);
                    StartOutcome::Opened
                } else {
                    StartOutcome::ClientGone
                }
            }
            previous => {
                *state = previous;
                StartOutcome::Duplicate
            }
        }
    }

    /// The chunk sender for `http_data`, if the stream is open. The caller
    /// sends outside the lock so a slow client can apply backpressure.
    pub fn chunk_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        match &*self.state.lock().unwrap() {
            PendingState::Streaming(tx) => Some(tx.clone()),
            _ => None,
        }
    }

    /// Consumes the state for `http_response_end` handling. Leaves `Done`.
    pub fn take_state(&self) -> TakenState {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, PendingState::Done) {
            PendingState::Awaiting(resolver) => TakenState::Awaiting(resolver),
            PendingState::Streaming(tx) => TakenState::Streaming(tx),
            PendingState::Done => TakenState::Done,
        }
    }

    /// Terminal failure: resolves a waiting request with `status` or, when
    /// the body stream is already open, closes it mid-flight.
    pub fn fail(&self, status: StatusCode, message: &'static str) {
        match self.take_state() {
            TakenState::Awaiting(resolver) => {
                let _ = resolver.send(Resolution::Failed { status, message });
            }
            TakenState::Streaming(tx) => drop(tx),
            TakenState::Done => {}
        }
    }
}

/// One connected agent: its assigned label, outbound queue, and the
/// registry of requests currently multiplexed over its channel.
pub struct ControlSession {
    pub subdomain: String,
    pub tx: ClientTx,
    pub requests: DashMap<String, PendingRequest>,
    pub remote_addr: Option<SocketAddr>,
    pub created_at: SystemTime,
}

impl ControlSession {
    pub fn new(subdomain: String, tx: ClientTx, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            subdomain,
            tx,
            requests: DashMap::new(),
            remote_addr,
            created_at: SystemTime::now(),
        }
    }

    /// Queues a message for the agent. Send failures mean the outbound
    /// task is gone; cleanup will run from the connection handler.
    pub fn send(&self, msg: ControlMessage) {
        let _ = self.tx.send(msg);
    }

    /// Fails every pending request uniformly and clears the registry.
    /// Used on session close and at shutdown.
    pub fn fail_pending(&self, status: StatusCode, message: &'static str) {
        for entry in self.requests.iter() {
            entry.value().fail(status, message);
        }
        self.requests.clear();
    }
}

/// Shared application state, cloned into each handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub rules: Arc<CompiledRules>,
    pub sessions: Arc<DashMap<String, Arc<ControlSession>>>,
}

impl AppState {
    /// Builds the state, compiling replacement rules up front so a broken
    /// pattern fails startup instead of the first response.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let rules = CompiledRules::compile(&config.replacements)?;
        Ok(Self {
            config: Arc::new(config),
            rules: Arc::new(rules),
            sessions: Arc::new(DashMap::new()),
        })
    }

    /// Allocates a label and registers a new session under it atomically.
    /// Losing an allocation race just rolls a new name.
    ///
    /// The `subdomain_assigned` greeting is queued before the session
    /// becomes visible in the directory, so it always precedes any
    /// `http_request` on the channel.
    pub fn register_session(
        &self,
        requested: Option<&str>,
        tx: ClientTx,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(Arc<ControlSession>, Allocation)> {
        loop {
            let taken: HashSet<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
            let allocation = subdomain::allocate(requested, &taken)?;
            match self.sessions.entry(allocation.name.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let session = Arc::new(ControlSession::new(
                        allocation.name.clone(),
                        tx,
                        remote_addr,
                    ));
                    session.send(ControlMessage::SubdomainAssigned {
                        subdomain: self.config.full_domain(&allocation.name),
                        requested: allocation.honored,
                    });
                    slot.insert(session.clone());
                    return Ok((session, allocation));
                }
            }
        }
    }

    /// Removes `session` from the directory if it is still the registered
    /// owner of its label.
    pub fn remove_session(&self, session: &Arc<ControlSession>) {
        self.sessions
            .remove_if(&session.subdomain, |_, registered| {
                Arc::ptr_eq(registered, session)
            });
    }

    pub fn lookup(&self, label: &str) -> Option<Arc<ControlSession>> {
        self.sessions.get(label).map(|entry| entry.value().clone())
    }

    /// Shutdown drain: terminate every pending request on every session.
    pub fn drain(&self) {
        for entry in self.sessions.iter() {
            entry
                .value()
                .fail_pending(StatusCode::SERVICE_UNAVAILABLE, "Client disconnected");
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_state() -> AppState {
        AppState::new(ServerConfig::default()).unwrap()
    }

    fn client_tx() -> ClientTx {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn start_resolves_once_and_opens_stream() {
        let (resolver, rx) = oneshot::channel();
        let pending = PendingRequest::new(resolver);
        assert!(pending.is_awaiting());

        let outcome = pending.start(200, HashMap::new());
        assert_eq!(outcome, StartOutcome::Opened);
        assert!(!pending.is_awaiting());
        assert!(pending.chunk_sender().is_some());

        // A duplicate start must not fire the resolver again.
        assert_eq!(pending.start(500, HashMap::new()), StartOutcome::Duplicate);

        match rx.await.unwrap() {
            Resolution::Response(response) => {
                assert_eq!(response.status, 200);
                assert!(matches!(response.body, AgentBody::Stream(_)));
            }
            Resolution::Failed { .. } => panic!("expected a streaming response"),
        }
    }

    #[tokio::test]
    async fn start_after_client_disconnect_reports_gone() {
        let (resolver, rx) = oneshot::channel::<Resolution>();
        drop(rx);
        let pending = PendingRequest::new(resolver);
        assert_eq!(pending.start(200, HashMap::new()), StartOutcome::ClientGone);
        assert!(pending.chunk_sender().is_none());
    }

    #[tokio::test]
    async fn fail_resolves_waiting_request() {
        let (resolver, rx) = oneshot::channel();
        let pending = PendingRequest::new(resolver);
        pending.fail(StatusCode::SERVICE_UNAVAILABLE, "Client disconnected");
        match rx.await.unwrap() {
            Resolution::Failed { status, message } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(message, "Client disconnected");
            }
            Resolution::Response(_) => panic!("expected a failure"),
        }
        // Nothing left to fail; must be a no-op.
        pending.fail(StatusCode::GATEWAY_TIMEOUT, "late");
    }

    #[tokio::test]
    async fn fail_closes_open_stream() {
        let (resolver, rx) = oneshot::channel();
        let pending = PendingRequest::new(resolver);
        pending.start(200, HashMap::new());
        let mut chunk_rx = match rx.await.unwrap() {
            Resolution::Response(AgentResponse {
                body: AgentBody::Stream(rx),
                ..
            }) => rx,
            _ => panic!("expected a stream"),
        };
        pending.fail(StatusCode::SERVICE_UNAVAILABLE, "Client disconnected");
        assert!(chunk_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn register_session_keeps_labels_unique() {
        let state = channel_state();
        let (first, allocation) = state
            .register_session(Some("alpha"), client_tx(), None)
            .unwrap();
        assert!(allocation.honored);
        assert_eq!(first.subdomain, "alpha");

        let (second, allocation) = state
            .register_session(Some("alpha"), client_tx(), None)
            .unwrap();
        assert!(!allocation.honored);
        assert_ne!(second.subdomain, "alpha");

        assert!(state.lookup("alpha").is_some());
        assert!(state.lookup(&second.subdomain).is_some());
        assert!(state.lookup("ghost").is_none());
    }

    #[tokio::test]
    async fn remove_session_only_removes_current_owner() {
        let state = channel_state();
        let (session, _) = state
            .register_session(Some("alpha"), client_tx(), None)
            .unwrap();
        state.remove_session(&session);
        assert!(state.lookup("alpha").is_none());

        // A successor under the same label survives a stale removal.
        let (successor, _) = state
            .register_session(Some("alpha"), client_tx(), None)
            .unwrap();
        state.remove_session(&session);
        assert!(state.lookup("alpha").is_some());
        state.remove_session(&successor);
        assert!(state.lookup("alpha").is_none());
    }

    #[tokio::test]
    async fn fail_pending_terminates_all_requests() {
        let state = channel_state();
        let (session, _) = state
            .register_session(Some("alpha"), client_tx(), None)
            .unwrap();

        let (resolver_a, rx_a) = oneshot::channel();
        let (resolver_b, rx_b) = oneshot::channel();
        session
            .requests
            .insert("a".to_string(), PendingRequest::new(resolver_a));
        session
            .requests
            .insert("b".to_string(), PendingRequest::new(resolver_b));

        session.fail_pending(StatusCode::SERVICE_UNAVAILABLE, "Client disconnected");
        assert!(session.requests.is_empty());
        for rx in [rx_a, rx_b] {
            match rx.await.unwrap() {
                Resolution::Failed { status, .. } => {
                    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE)
                }
                Resolution::Response(_) => panic!("expected a failure"),
            }
        }
    }
}
