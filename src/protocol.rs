//! # Control Protocol Messages
//!
//! Defines all message types exchanged between the server and connected
//! agents over the control channel. Messages are serialized as JSON text
//! frames using serde's internally-tagged representation (`"type": "..."`
//! field), e.g. `ControlMessage::SubdomainAssigned` serializes to
//! `{"type": "subdomain_assigned", ...}`.
//!
//! Body chunks travel as [`ByteString`]: a binary-safe JSON string where
//! each byte is one code unit 0–255. Agents may instead send a plain JSON
//! byte array; both forms decode to the same bytes.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// All messages of the control protocol.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    // ── Session setup ─────────────────────────────────────────────

    /// Sent once by the server after the upgrade. `subdomain` is the full
    /// public domain; `requested` tells the agent whether its preferred
    /// name was honored.
    SubdomainAssigned { subdomain: String, requested: bool },

    // ── Request forwarding (server → agent) ───────────────────────

    /// A public request for the agent to fulfil locally. `body` carries
    /// the decoded textual request body and is absent for GET/HEAD.
    HttpRequest {
        id: String,
        method: String,
        url: String,
        path: String,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    // ── Response delivery (agent → server) ────────────────────────

    /// Begins the response for `id` with its status and headers. Body
    /// bytes follow as `http_data` chunks.
    HttpResponseStart {
        id: String,
        #[serde(rename = "statusCode")]
        status_code: u16,
        headers: HashMap<String, String>,
    },

    /// One body chunk for an in-flight response.
    HttpData { id: String, data: ByteString },

    /// Terminates the response for `id`. If a response stream is already
    /// open, `body` (when present) becomes the final chunk and
    /// `status`/`headers` are ignored; otherwise this message alone
    /// constructs the response.
    HttpResponseEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<ByteString>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },

    // ── Heartbeat ─────────────────────────────────────────────────

    Ping,
    Pong,

    // ── Error ─────────────────────────────────────────────────────

    /// Observer-only error notification; never alters session state.
    Error { message: String },
}

/// Message types the dispatcher recognizes, as they appear on the wire.
const KNOWN_TYPES: &[&str] = &[
    "subdomain_assigned",
    "http_request",
    "http_response_start",
    "http_data",
    "http_response_end",
    "ping",
    "pong",
    "error",
];

/// Why an incoming frame could not be turned into a [`ControlMessage`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Parses one inbound text frame.
///
/// Distinguishes an unknown `type` (the session replies with an `error`
/// frame naming it and survives) from a structurally broken message.
pub fn parse_message(text: &str) -> Result<ControlMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing `type` field".to_string()))?;
    if !KNOWN_TYPES.contains(&tag) {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Raw bytes carried inside a JSON message.
///
/// Serializes as a string whose chars are the byte values (so the frame
/// stays valid JSON regardless of content); deserializes from either that
/// string form or a byte array. A string char above U+00FF is rejected —
/// it would not round-trip byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ByteString(pub Vec<u8>);

impl ByteString {
    pub fn into_bytes(self) -> bytes::Bytes {
        bytes::Bytes::from(self.0)
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for ByteString {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for ByteString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text: String = self.0.iter().map(|&b| char::from(b)).collect();
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for ByteString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteStringVisitor;

        impl<'de> Visitor<'de> for ByteStringVisitor {
            type Value = ByteString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a binary-safe string or a byte array")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteString, E> {
                let mut bytes = Vec::with_capacity(v.len());
                for c in v.chars() {
                    let code = c as u32;
                    if code > 0xFF {
                        return Err(E::custom(format!(
                            "code point U+{code:04X} exceeds byte range"
                        )));
                    }
                    bytes.push(code as u8);
                }
                Ok(ByteString(bytes))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<ByteString, E> {
                Ok(ByteString(v.to_vec()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<ByteString, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(ByteString(bytes))
            }
        }

        deserializer.deserialize_any(ByteStringVisitor)
    }
}
