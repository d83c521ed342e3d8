//! # Server Configuration
//!
//! Static configuration for the tunnel server, immutable after startup.
//! Loaded from a TOML file (path via `CHARA_TUNNEL_CONFIG` or the first
//! CLI argument), with environment-variable overrides for the settings
//! that change between deployments. Field names on disk match the wire
//! documentation (`controlDomain`, `requestTimeoutMs`, ...).

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TunnelError};

/// A single body rewrite rule, applied to textual responses in declared
/// order. `pattern` is a literal unless `regex` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct TextReplacement {
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Public listener port.
    pub port: u16,

    /// Root domain under which subdomains are allocated
    /// (e.g. `tunnel.example.dev`).
    pub domain: String,

    /// Host that serves the control upgrade endpoint. Empty means
    /// "same as `domain`".
    pub control_domain: String,

    /// Ordered body rewrite rules for textual responses.
    pub replacements: Vec<TextReplacement>,

    /// Time allowed from request creation to the first
    /// `http_response_start`.
    pub request_timeout_ms: u64,

    /// Codings the server is willing to apply to responses.
    pub accepted_encodings: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            domain: "localhost".to_string(),
            control_domain: String::new(),
            replacements: Vec::new(),
            request_timeout_ms: 30_000,
            accepted_encodings: vec!["gzip".to_string()],
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist. Environment overrides (`CHARA_TUNNEL_PORT`,
    /// `CHARA_TUNNEL_DOMAIN`, `CHARA_TUNNEL_CONTROL_DOMAIN`) are applied
    /// on top, then the result is validated.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    TunnelError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                toml::from_str(&content).map_err(|e| {
                    TunnelError::Config(format!("failed to parse {}: {e}", path.display()))
                })?
            }
            None => Self::default(),
        };

        if let Ok(port) = std::env::var("CHARA_TUNNEL_PORT") {
            config.port = port
                .parse()
                .map_err(|_| TunnelError::Config(format!("invalid port `{port}`")))?;
        }
        if let Ok(domain) = std::env::var("CHARA_TUNNEL_DOMAIN") {
            config.domain = domain;
        }
        if let Ok(control) = std::env::var("CHARA_TUNNEL_CONTROL_DOMAIN") {
            config.control_domain = control;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(TunnelError::Config("domain must not be empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(TunnelError::Config(
                "requestTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The host serving `/_chara/connect`.
    pub fn control_domain(&self) -> &str {
        if self.control_domain.is_empty() {
            &self.domain
        } else {
            &self.control_domain
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Full public domain for an allocated subdomain label.
    pub fn full_domain(&self, label: &str) -> String {
        format!("{label}.{}", self.domain)
    }
}
