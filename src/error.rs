//! Error taxonomy for the harvesting pipeline.
//!
//! Classification drives the resilience layer: transient network failures
//! and server overload are retriable and count against the shared circuit
//! breaker, while protocol-level rejections are terminal and surface
//! immediately without touching breaker health.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Errors produced by the crawling core.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Timeouts, connection resets, DNS failures. The upstream may recover.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429 or 5xx from the origin.
    #[error("server overload: HTTP {status}")]
    ServerOverload { status: u16 },

    /// HTTP 400/401/403/404: an input or authorization condition, never
    /// retried at the transport level.
    #[error("protocol error: HTTP {status}")]
    Protocol { status: u16 },

    /// Login verification failed; bounded re-authentication may recover it.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The breaker denied the call without touching the network.
    #[error("circuit breaker open, next trial in {remaining:?}")]
    CircuitOpen { remaining: Duration },

    /// All retry attempts were consumed; carries the last failure.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<HarvestError>,
    },

    /// The continuation token was absent from a page that must carry one.
    #[error("continuation token missing from {page}")]
    TokenMissing { page: String },

    /// Scraped form identifiers failed validation.
    #[error("search form capability invalid: {0}")]
    FormCapability(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The persistence collaborator reported a failure.
    #[error("store error: {0}")]
    Store(String),

    #[error("shutdown requested")]
    Cancelled,
}

impl HarvestError {
    /// Map an HTTP status code to an error, or `None` for success statuses.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=399 => None,
            400 | 401 | 403 | 404 => Some(Self::Protocol { status }),
            429 => Some(Self::ServerOverload { status }),
            500..=599 => Some(Self::ServerOverload { status }),
            other => Some(Self::Protocol { status: other }),
        }
    }

    /// Whether a retry loop may attempt the operation again.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::ServerOverload { .. }
            | Self::Authentication(_)
            | Self::TokenMissing { .. }
            | Self::FormCapability(_) => true,
            Self::RetryExhausted { source, .. } => source.is_retriable(),
            Self::Protocol { .. }
            | Self::CircuitOpen { .. }
            | Self::Config(_)
            | Self::Store(_)
            | Self::Cancelled => false,
        }
    }

    /// Whether this failure reflects upstream health and should be reported
    /// to the circuit breaker. Business conditions (protocol rejections,
    /// auth verification) do not.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ServerOverload { .. })
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerOverload { status } | Self::Protocol { status } => Some(*status),
            Self::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if let Some(mapped) = Self::from_status(status.as_u16()) {
                return mapped;
            }
        }
        Self::Network(err.to_string())
    }
}
