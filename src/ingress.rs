//! # Public HTTP Ingress
//!
//! Catch-all handler for requests arriving on the public listener. The
//! first DNS label of the `Host` header selects the owning control
//! session; the request is encoded as an `http_request` control message
//! and the handler suspends until the agent's response resolves it, the
//! per-request timer fires, or the session dies.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline;
use crate::protocol::ControlMessage;
use crate::state::{AppState, ControlSession, PendingRequest, Resolution};

/// Host header without the port part.
pub(crate) fn request_host(headers: &HeaderMap) -> &str {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
}

/// Fallback handler: everything that is not a control-domain endpoint is
/// a public tunnel request.
pub async fn public_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let host = request_host(req.headers()).to_string();
    let label = host.split('.').next().unwrap_or_default().to_string();

    let Some(session) = state.lookup(&label) else {
        debug!(%host, "request for unknown tunnel");
        return unknown_tunnel(&state, &label);
    };

    forward(&state, session, req, host).await
}

fn unknown_tunnel(state: &AppState, label: &str) -> Response {
    let control = state.config.control_domain();
    (
        StatusCode::NOT_FOUND,
        format!(
            "No tunnel is registered for \"{label}\". \
             Connect an agent to {control}{} to create one.\n",
            crate::handlers::CONNECT_PATH
        ),
    )
        .into_response()
}

/// Removes an entry the ingress abandoned (timeout or client disconnect)
/// as long as no response has started; once a stream is open the session's
/// dispatch task owns the entry.
struct RequestGuard<'a> {
    session: &'a ControlSession,
    id: &'a str,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let removed = self
            .session
            .requests
            .remove_if(self.id, |_, pending| pending.is_awaiting());
        if let Some((_, pending)) = removed {
            debug!(
                subdomain = %self.session.subdomain,
                id = %self.id,
                age = ?pending.age(),
                "removed unresolved request entry"
            );
        }
    }
}

async fn forward(
    state: &AppState,
    session: Arc<ControlSession>,
    req: Request<Body>,
    host: String,
) -> Response {
    let (parts, body) = req.into_parts();

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    // Behind a TLS terminator the original scheme arrives as a header.
    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let url = format!("{scheme}://{host}{path_and_query}");
    let accept_encoding = parts
        .headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut header_map: HashMap<String, String> = HashMap::new();
    for (name, value) in parts.headers.iter() {
        let Ok(value) = value.to_str() else { continue };
        header_map
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    // v1 forwards the request body inline, decoded as text.
    let request_body = if method == Method::GET || method == Method::HEAD {
        None
    } else {
        match to_bytes(body, usize::MAX).await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!(subdomain = %session.subdomain, "failed to read request body: {e}");
                return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
            }
        }
    };

    let id = Uuid::new_v4().to_string();
    let (resolver, resolve_rx) = oneshot::channel();
    session
        .requests
        .insert(id.clone(), PendingRequest::new(resolver));
    let _guard = RequestGuard {
        session: &session,
        id: &id,
    };

    debug!(
        subdomain = %session.subdomain,
        id = %id,
        method = %method,
        path = %path,
        "forwarding public request"
    );
    session.send(ControlMessage::HttpRequest {
        id: id.clone(),
        method: method.to_string(),
        url,
        path,
        headers: header_map,
        body: request_body,
    });

    match tokio::time::timeout(state.config.request_timeout(), resolve_rx).await {
        Ok(Ok(Resolution::Response(response))) => pipeline::assemble(
            response,
            accept_encoding.as_deref(),
            &state.rules,
            &state.config,
        ),
        Ok(Ok(Resolution::Failed { status, message })) => (status, message).into_response(),
        Ok(Err(_)) => {
            // The entry vanished without resolving; treat it like a dead
            // session.
            (StatusCode::SERVICE_UNAVAILABLE, "Client disconnected").into_response()
        }
        Err(_) => {
            warn!(
                subdomain = %session.subdomain,
                id = %id,
                "no response start within the request timeout"
            );
            let secs = state.config.request_timeout_ms / 1000;
            (
                StatusCode::GATEWAY_TIMEOUT,
                format!("Request timeout after {secs} seconds"),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;

    use crate::config::ServerConfig;

    fn test_state() -> AppState {
        let config: ServerConfig = toml::from_str(r#"domain = "t.local""#).unwrap();
        AppState::new(config).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unknown_host_points_at_control_domain() {
        let state = test_state();
        let req = Request::builder()
            .uri("/hello")
            .header(header::HOST, "ghost.t.local")
            .body(Body::empty())
            .unwrap();
        let response = public_handler(State(state), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let text = body_text(response).await;
        assert!(text.contains("ghost"));
        assert!(text.contains("t.local/_chara/connect"));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_without_response_start() {
        let state = test_state();
        let (tx, mut agent_rx) = mpsc::unbounded_channel();
        let (session, _) = state.register_session(Some("alpha"), tx, None).unwrap();

        let req = Request::builder()
            .uri("/slow")
            .header(header::HOST, "alpha.t.local:443")
            .body(Body::empty())
            .unwrap();
        let response = public_handler(State(state.clone()), req).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_text(response).await, "Request timeout after 30 seconds");

        // Greeting first, then the forwarded request; the abandoned entry
        // is gone.
        assert!(matches!(
            agent_rx.recv().await,
            Some(ControlMessage::SubdomainAssigned { .. })
        ));
        match agent_rx.recv().await {
            Some(ControlMessage::HttpRequest { method, path, .. }) => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/slow");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(session.requests.is_empty());
    }

    #[tokio::test]
    async fn request_encodes_url_headers_and_body() {
        let state = test_state();
        let (tx, mut agent_rx) = mpsc::unbounded_channel();
        let (session, _) = state.register_session(Some("alpha"), tx, None).unwrap();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/submit?q=1")
            .header(header::HOST, "alpha.t.local")
            .header("x-forwarded-proto", "https")
            .header("x-custom", "yes")
            .body(Body::from("payload"))
            .unwrap();

        // Resolve the request from a simulated dispatch task so the
        // handler returns.
        let responder = tokio::spawn({
            let session = session.clone();
            async move {
                let greeting = agent_rx.recv().await.unwrap();
                assert!(matches!(
                    greeting,
                    ControlMessage::SubdomainAssigned { .. }
                ));
                let msg = agent_rx.recv().await.unwrap();
                let ControlMessage::HttpRequest {
                    id,
                    method,
                    url,
                    path,
                    headers,
                    body,
                } = msg
                else {
                    panic!("expected an http_request");
                };
                assert_eq!(method, "POST");
                assert_eq!(url, "https://alpha.t.local/submit?q=1");
                assert_eq!(path, "/submit");
                assert_eq!(headers["x-custom"], "yes");
                assert_eq!(body.as_deref(), Some("payload"));

                let entry = session.requests.get(&id).unwrap();
                entry.start(204, HashMap::new());
            }
        });

        let response = public_handler(State(state), req).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        responder.await.unwrap();
    }
}
