//! # Introspection API
//!
//! Control-domain endpoint for querying server state. Exposes the list of
//! active tunnels so dashboards and operators can see what is connected.

use std::time::UNIX_EPOCH;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ingress::request_host;
use crate::state::AppState;

/// One active tunnel.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelListItem {
    /// Assigned label (e.g. "chara-misty-cedar-otter").
    pub subdomain: String,
    /// Full public domain for the tunnel.
    pub domain: String,
    /// Requests currently in flight over this session.
    pub pending_requests: usize,
    /// Connection time as seconds since the Unix epoch.
    pub connected_at_secs: u64,
    /// Agent's remote address, when known.
    pub remote_addr: Option<String>,
}

/// `GET /_chara/tunnels` — JSON array of all active tunnels.
///
/// Served only on the control domain; like the upgrade endpoint, the
/// path is reserved and answers 404 on any other host.
pub async fn list_tunnels(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !request_host(&headers).eq_ignore_ascii_case(state.config.control_domain()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let tunnels: Vec<TunnelListItem> = state
        .sessions
        .iter()
        .map(|entry| {
            let session = entry.value();
            TunnelListItem {
                subdomain: session.subdomain.clone(),
                domain: state.config.full_domain(&session.subdomain),
                pending_requests: session.requests.len(),
                connected_at_secs: session
                    .created_at
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default(),
                remote_addr: session.remote_addr.map(|addr| addr.to_string()),
            }
        })
        .collect();
    Json(tunnels).into_response()
}
