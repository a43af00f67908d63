//! Error types for the rotating-fetch crate.

use reqwest::StatusCode;
use thiserror::Error;

/// Transport-level failure, already classified by the [`Transport`](crate::dispatch::Transport)
/// implementation so the dispatcher never has to sniff error strings.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection-level failure: refused, reset, SSL, or a proxy tunnel that
    /// could not be established. When this happens through a proxy, the proxy
    /// is to blame.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,
    /// Anything else the HTTP client reported.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether this error counts as a connection-level failure and should be
    /// blamed on the proxy it was incurred through.
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Timeout)
    }
}

/// Error surfaced to callers of [`Dispatcher::dispatch`](crate::dispatch::Dispatcher::dispatch)
/// and classified by the retry ladder of [`fetch_all`](crate::batch::fetch_all).
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Rate limited (429) and the direct-mode retry budget is exhausted.
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: usize },
    /// The server blocked us outright (403). Not retryable by this layer.
    #[error("blocked by server (status {status})")]
    Blocked { status: StatusCode },
    /// Some other non-success HTTP status survived all retries.
    #[error("request failed with status {status}")]
    Status { status: StatusCode },
    /// The last transport error after all retries.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Coarse error classification used by the bounded concurrent fetcher to pick
/// a backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Server-side rate limiting.
    RateLimited,
    /// Connection-level trouble (SSL, timeout, reset). Backed off harder.
    Connection,
    /// Everything else.
    Other,
}

impl FetchError {
    /// Map this error onto the retry ladder of [`fetch_all`](crate::batch::fetch_all).
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::RateLimited { .. } => FetchErrorKind::RateLimited,
            FetchError::Transport(e) if e.is_connection() => FetchErrorKind::Connection,
            _ => FetchErrorKind::Other,
        }
    }
}
