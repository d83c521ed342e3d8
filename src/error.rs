use thiserror::Error;

/// Errors that can end the server or refuse a control-channel upgrade.
///
/// Per-request failures (timeouts, agent disconnects, transform problems)
/// are not represented here; they resolve into HTTP error responses for
/// the public caller and never propagate as `TunnelError`.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid replacement pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    /// The allocator ran out of candidate subdomains. Practically
    /// unreachable; surfaced to the upgrading agent as an upgrade failure.
    #[error("subdomain space exhausted")]
    AllocatorExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
