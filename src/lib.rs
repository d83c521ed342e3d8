//! # Chara Tunnel Server
//!
//! A reverse HTTP tunnel server. Agents behind NAT hold a persistent
//! WebSocket **control channel** to this server and receive a unique
//! public subdomain; requests arriving for `<subdomain>.<root-domain>`
//! are forwarded over that channel and the agent streams the response
//! back, optionally rewritten and re-compressed on the way out.
//!
//! ## Architecture
//!
//! ```text
//! Browser ──HTTP──► Tunnel Server ──WS──► Agent ──HTTP──► Local Service
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]  — control message types (JSON-serialized)
//! - [`state`]     — session directory and per-request state
//! - [`handlers`]  — control channel lifecycle and message dispatch
//! - [`ingress`]   — public HTTP ingress routed by `Host`
//! - [`pipeline`]  — response transforms (substitution, compression)
//! - [`subdomain`] — label validation and allocation
//! - [`api`]       — introspection endpoints

pub mod api;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ingress;
pub mod pipeline;
pub mod protocol;
pub mod rewrite;
pub mod state;
pub mod subdomain;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the complete router: the control-domain endpoints plus the
/// catch-all public ingress.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route(handlers::CONNECT_PATH, get(handlers::connect_handler))
        .route("/_chara/tunnels", get(api::list_tunnels))
        .fallback(ingress::public_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
