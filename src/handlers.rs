//! # Control Channel Handlers
//!
//! Core WebSocket logic for the tunnel server:
//! - Upgrading control connections on `/_chara/connect`
//! - Managing each session's lifecycle (outbound task, serial inbound
//!   dispatch, cleanup that terminates pending requests)
//! - Dispatching incoming control messages to the per-request state

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, FromRequest, Query, State, WebSocketUpgrade};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::ingress::request_host;
use crate::protocol::{self, ByteString, ControlMessage};
use crate::state::{
    AgentBody, AgentResponse, AppState, ControlSession, Resolution, StartOutcome, TakenState,
};

/// Path of the control upgrade endpoint on the control domain.
pub const CONNECT_PATH: &str = "/_chara/connect";

/// Shown to plain HTTP probes of the upgrade endpoint.
const CONNECT_INFO: &str = "\
This is the tunnel control endpoint.

Connect with a WebSocket client to open a control channel:

    GET /_chara/connect?subdomain=<label>    (subdomain is optional)

The server replies with a `subdomain_assigned` message, then forwards
public requests as `http_request` messages. Respond with
`http_response_start`, `http_data` chunks, and `http_response_end`.
All messages are JSON objects with a `type` field.
";

#[derive(Deserialize)]
struct ConnectParams {
    subdomain: Option<String>,
}

// ─── Control Upgrade Endpoint ───────────────────────────────────

/// `GET /_chara/connect` — upgrades to the duplex control channel.
///
/// Only served on the configured control domain; anything else is 404.
/// Plain (non-upgrade) requests get an informational 200 so probing the
/// endpoint with curl explains the protocol.
pub async fn connect_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let host = request_host(req.headers());
    if !host.eq_ignore_ascii_case(state.config.control_domain()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let requested = Query::<ConnectParams>::try_from_uri(req.uri())
        .ok()
        .and_then(|params| params.0.subdomain);

    if !is_ws_upgrade(&req) {
        return (StatusCode::OK, CONNECT_INFO).into_response();
    }
    match WebSocketUpgrade::from_request(req, &state).await {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_connection(socket, state, requested, Some(addr)))
            .into_response(),
        Err(_) => (StatusCode::OK, CONNECT_INFO).into_response(),
    }
}

fn is_ws_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

// ─── Session Lifecycle ──────────────────────────────────────────

/// Manages the full lifecycle of one control session.
///
/// ## Flow:
/// 1. Split the socket and spawn an outbound task that serializes queued
///    messages to text frames
/// 2. Allocate a subdomain and register the session in the directory
///    (registration queues the `subdomain_assigned` greeting)
/// 3. Dispatch incoming messages serially on the current task
/// 4. On disconnect: deregister and fail every pending request with 503
async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    requested: Option<String>,
    addr: Option<SocketAddr>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Unbounded queue feeding the outbound task; every part of the server
    // reaches this agent through its clone in the session.
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("failed to serialize control message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break; // socket closed; stop sending
            }
        }
    });

    let (session, allocation) = match state.register_session(requested.as_deref(), tx.clone(), addr)
    {
        Ok(registered) => registered,
        Err(e) => {
            error!("refusing control connection: {e}");
            let _ = tx.send(ControlMessage::Error {
                message: e.to_string(),
            });
            drop(tx);
            let _ = outbound_task.await; // drain the error frame, then hang up
            return;
        }
    };

    // Registration already queued the `subdomain_assigned` greeting.
    info!(
        subdomain = %session.subdomain,
        honored = allocation.honored,
        remote = ?addr,
        "agent connected"
    );

    // Serial inbound dispatch: this loop is the only writer into the
    // session's request state.
    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(text) => text.to_string(),
            // Agents may switch to binary frames; same JSON inside.
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    session.send(ControlMessage::Error {
                        message: "binary frame is not valid UTF-8".to_string(),
                    });
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };
        match protocol::parse_message(&text) {
            Ok(message) => handle_message(&session, message).await,
            Err(e) => {
                warn!(subdomain = %session.subdomain, "rejected control message: {e}");
                session.send(ControlMessage::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    // ── Cleanup on Disconnect ──
    info!(subdomain = %session.subdomain, "agent disconnected");
    outbound_task.abort();
    state.remove_session(&session);
    session.fail_pending(StatusCode::SERVICE_UNAVAILABLE, "Client disconnected");
}

// ─── Message Dispatcher ─────────────────────────────────────────

/// Handles one incoming control message from the agent.
///
/// Response messages referencing an id the session does not know are
/// logged and dropped; late chunks after a timeout or disconnect land
/// here by design and must not disturb anything else.
pub async fn handle_message(session: &Arc<ControlSession>, msg: ControlMessage) {
    match msg {
        // ── Heartbeat ──
        ControlMessage::Ping => session.send(ControlMessage::Pong),
        ControlMessage::Pong => {}

        // ── Response lifecycle ──
        ControlMessage::HttpResponseStart {
            id,
            status_code,
            headers,
        } => {
            let outcome = match session.requests.get(&id) {
                Some(pending) => pending.start(status_code, headers),
                None => {
                    warn!(
                        subdomain = %session.subdomain,
                        id = %id,
                        "response start for unknown request"
                    );
                    return;
                }
            };
            match outcome {
                StartOutcome::Opened => {}
                StartOutcome::ClientGone => {
                    debug!(id = %id, "public client left before the response started");
                    session.requests.remove(&id);
                }
                StartOutcome::Duplicate => {
                    warn!(subdomain = %session.subdomain, id = %id, "duplicate response start")
                }
            }
        }

        ControlMessage::HttpData { id, data } => {
            let sender = match session.requests.get(&id) {
                Some(pending) => pending.chunk_sender(),
                None => {
                    warn!(
                        subdomain = %session.subdomain,
                        id = %id,
                        "data chunk for unknown request"
                    );
                    return;
                }
            };
            let Some(sender) = sender else {
                warn!(subdomain = %session.subdomain, id = %id, "data chunk outside an open stream");
                return;
            };
            // Suspends when the public client reads slowly; that is the
            // backpressure path toward the agent.
            if sender.send(data.into_bytes()).await.is_err() {
                debug!(id = %id, "public client left mid-stream; dropping request");
                session.requests.remove(&id);
            }
        }

        ControlMessage::HttpResponseEnd {
            id,
            body,
            status,
            headers,
        } => {
            let Some((_, pending)) = session.requests.remove(&id) else {
                warn!(
                    subdomain = %session.subdomain,
                    id = %id,
                    "response end for unknown request"
                );
                return;
            };
            match pending.take_state() {
                TakenState::Streaming(sender) => {
                    if status.is_some() || headers.is_some() {
                        debug!(id = %id, "ignoring overrides after response start");
                    }
                    if let Some(final_chunk) = body {
                        let _ = sender.send(final_chunk.into_bytes()).await;
                    }
                    // Dropping the sender closes the body stream.
                }
                TakenState::Awaiting(resolver) => {
                    let response = AgentResponse {
                        status: status.unwrap_or(200),
                        headers: headers.unwrap_or_default(),
                        body: AgentBody::Full(
                            body.map(ByteString::into_bytes).unwrap_or_default(),
                        ),
                    };
                    let _ = resolver.send(Resolution::Response(response));
                }
                TakenState::Done => {}
            }
        }

        // ── Observer-only ──
        ControlMessage::Error { message } => {
            warn!(subdomain = %session.subdomain, %message, "agent reported an error")
        }

        // Server-originated types bounced back by a confused agent.
        ControlMessage::SubdomainAssigned { .. } | ControlMessage::HttpRequest { .. } => {
            session.send(ControlMessage::Error {
                message: "unexpected server-originated message type".to_string(),
            });
        }
    }
}
