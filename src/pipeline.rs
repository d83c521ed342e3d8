//! # Response Pipeline
//!
//! Assembles the public response for a resolved request: optional text
//! substitution (textual content types only), optional recompression
//! (only when the original request advertised a coding the server
//! accepts), then header finalization. Order is substitution →
//! compression → response. The pipeline never buffers a streamed body;
//! both transforms wrap the chunk stream.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_compression::tokio::bufread::{BrotliEncoder, GzipEncoder, ZlibEncoder};
use axum::body::Body;
use axum::http::header::CONTENT_ENCODING;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;

use crate::config::ServerConfig;
use crate::rewrite::{rewrite_stream, CompiledRules};
use crate::state::{AgentBody, AgentResponse};

/// Codings the pipeline can produce, in server preference order.
const SUPPORTED_CODINGS: &[&str] = &["gzip", "deflate", "br"];

/// Substitution gate: only bodies that are text get rewritten.
fn is_textual(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("text/") || ct.contains("html") || ct.contains("xml")
}

/// Compression gate: textual bodies plus the common structured types.
fn is_compressible(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    is_textual(&ct) || ct.contains("json") || ct.contains("javascript") || ct.contains("svg")
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Picks the coding to apply from the original request's `Accept-Encoding`
/// (first listed token that the server configuration accepts and the
/// pipeline supports).
pub fn negotiate_encoding(
    accept_encoding: Option<&str>,
    accepted: &[String],
) -> Option<&'static str> {
    let accept = accept_encoding?;
    for token in accept.split(',') {
        let token = token
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if token.is_empty() || token == "identity" {
            continue;
        }
        if accepted.iter().any(|a| a.eq_ignore_ascii_case(&token)) {
            if let Some(coding) = SUPPORTED_CODINGS.iter().find(|c| **c == token) {
                return Some(*coding);
            }
        }
    }
    None
}

/// Builds the final public response from what the agent delivered.
pub fn assemble(
    response: AgentResponse,
    accept_encoding: Option<&str>,
    rules: &Arc<CompiledRules>,
    config: &ServerConfig,
) -> Response {
    let AgentResponse {
        status,
        headers,
        body,
    } = response;

    let status = match StatusCode::from_u16(status) {
        Ok(status) => status,
        Err(_) => {
            warn!(status, "agent sent an invalid status code");
            StatusCode::BAD_GATEWAY
        }
    };

    let content_type = header(&headers, "content-type").unwrap_or_default();
    // A body the agent delivered already compressed is opaque: neither
    // substituted nor re-encoded, original Content-Encoding passed through.
    let already_encoded =
        header(&headers, "content-encoding").is_some_and(|v| !v.eq_ignore_ascii_case("identity"));

    let substitute = !rules.is_empty() && !already_encoded && is_textual(content_type);
    let coding = if already_encoded || !is_compressible(content_type) {
        None
    } else {
        negotiate_encoding(accept_encoding, &config.accepted_encodings)
    };
    let body_transformed = substitute || coding.is_some();

    let final_body = match body {
        AgentBody::Full(bytes) if !body_transformed => Body::from(bytes),
        body => {
            let mut stream: BoxStream<'static, io::Result<Bytes>> = match body {
                AgentBody::Full(bytes) => futures::stream::iter([Ok(bytes)]).boxed(),
                AgentBody::Stream(rx) => ReceiverStream::new(rx).map(Ok).boxed(),
            };
            if substitute {
                stream = rewrite_stream(stream, rules.clone()).boxed();
            }
            if let Some(coding) = coding {
                stream = encode_stream(stream, coding);
            }
            Body::from_stream(stream)
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            // Transforms invalidate the upstream length; hyper re-frames.
            "content-length" if body_transformed => continue,
            "content-encoding" if coding.is_some() => continue,
            "transfer-encoding" | "connection" => continue,
            _ => {}
        }
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => warn!(header = %name, "dropping invalid response header"),
        }
    }
    if let Some(coding) = coding {
        builder = builder.header(CONTENT_ENCODING, coding);
    }

    match builder.body(final_body) {
        Ok(response) => response,
        Err(e) => {
            warn!("failed to finalize response: {e}");
            let mut response = Response::new(Body::from("Bad gateway"));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            response
        }
    }
}

fn encode_stream(
    stream: BoxStream<'static, io::Result<Bytes>>,
    coding: &str,
) -> BoxStream<'static, io::Result<Bytes>> {
    let reader = StreamReader::new(stream);
    match coding {
        "gzip" => ReaderStream::new(GzipEncoder::new(reader)).boxed(),
        "deflate" => ReaderStream::new(ZlibEncoder::new(reader)).boxed(),
        "br" => ReaderStream::new(BrotliEncoder::new(reader)).boxed(),
        other => {
            warn!(coding = %other, "unsupported coding slipped past negotiation");
            ReaderStream::new(reader).boxed()
        }
    }
}
