//! Error types of the exchange loop.

use std::io;
use std::time::SystemTime;
use thiserror::Error;

/// Every failure the exchange loop can observe.
///
/// The variant decides how the orchestrator reacts: client-caused failures
/// become a `400`, transient network failures are retried once, and protocol
/// failures become a `502` or end the connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client went away cleanly before sending a request.
    #[error("client disconnected")]
    Disconnect,

    #[error("invalid request form: {reason}")]
    Form { reason: String },

    #[error("invalid http request: {reason}")]
    Http { reason: String },

    #[error("network error: {source}")]
    Network {
        #[from]
        source: io::Error,
    },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("http/2 protocol error: {reason}")]
    Http2Protocol { reason: String },

    #[error("upstream proxy {proxy} rejected credentials of {username}")]
    Auth { proxy: String, username: String },
}

impl ProxyError {
    pub fn form<S: ToString>(str: S) -> Self {
        Self::Form { reason: str.to_string() }
    }

    pub fn http<S: ToString>(str: S) -> Self {
        Self::Http { reason: str.to_string() }
    }

    pub fn protocol<S: ToString>(str: S) -> Self {
        Self::Protocol { reason: str.to_string() }
    }

    pub fn http2_protocol<S: ToString>(str: S) -> Self {
        Self::Http2Protocol { reason: str.to_string() }
    }

    pub fn network<E: Into<io::Error>>(e: E) -> Self {
        Self::Network { source: e.into() }
    }

    /// Failures caused by what the client sent; answered with a `400`.
    #[inline]
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProxyError::Form { .. } | ProxyError::Http { .. })
    }

    /// Transient upstream I/O failures, eligible for the single reconnect.
    #[inline]
    pub fn is_network(&self) -> bool {
        matches!(self, ProxyError::Network { .. })
    }
}

/// The error record attached to a flow once an exchange fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    pub msg: String,
    pub timestamp: SystemTime,
}

impl FlowError {
    pub fn new<S: ToString>(msg: S) -> Self {
        Self { msg: msg.to_string(), timestamp: SystemTime::now() }
    }
}

impl From<&ProxyError> for FlowError {
    fn from(e: &ProxyError) -> Self {
        FlowError::new(e)
    }
}
