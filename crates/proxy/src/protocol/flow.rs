//! The flow: one exchange as seen by hooks.

use std::collections::HashMap;

use serde_json::Value;

use crate::mode::HttpMode;
use crate::protocol::{Address, FlowError, ProxyError, Request, Response};

pub const WEBSOCKET_METADATA_KEY: &str = "websocket";

/// A snapshot of one connection end, taken when the flow is created and
/// refreshed once the upstream response has been read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub address: Option<Address>,
    pub tls_established: bool,
}

impl ConnectionInfo {
    pub fn new(address: Option<Address>, tls_established: bool) -> Self {
        Self { address, tls_established }
    }
}

/// One request/response exchange and everything hooks may inspect about it.
///
/// The orchestrator owns the flow; hooks only ever borrow it for the duration
/// of a single call.
#[derive(Debug)]
pub struct Flow {
    pub request: Option<Request>,
    pub response: Option<Response>,
    pub client_conn: ConnectionInfo,
    pub server_conn: ConnectionInfo,
    pub mode: HttpMode,
    pub error: Option<FlowError>,
    pub metadata: HashMap<String, Value>,
    live: bool,
    upstream_proxy_change: Option<Address>,
}

impl Flow {
    pub fn new(client_conn: ConnectionInfo, server_conn: ConnectionInfo, mode: HttpMode) -> Self {
        Self {
            request: None,
            response: None,
            client_conn,
            server_conn,
            mode,
            error: None,
            metadata: HashMap::new(),
            live: true,
            upstream_proxy_change: None,
        }
    }

    /// Whether the orchestrator is still working on this flow.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub(crate) fn finish(&mut self) {
        self.live = false;
    }

    pub fn request(&self) -> Result<&Request, ProxyError> {
        self.request.as_ref().ok_or_else(|| ProxyError::protocol("flow has no request"))
    }

    pub fn request_mut(&mut self) -> Result<&mut Request, ProxyError> {
        self.request.as_mut().ok_or_else(|| ProxyError::protocol("flow has no request"))
    }

    pub fn response(&self) -> Result<&Response, ProxyError> {
        self.response.as_ref().ok_or_else(|| ProxyError::protocol("flow has no response"))
    }

    pub fn response_mut(&mut self) -> Result<&mut Response, ProxyError> {
        self.response.as_mut().ok_or_else(|| ProxyError::protocol("flow has no response"))
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.metadata.get(WEBSOCKET_METADATA_KEY), Some(Value::Bool(true)))
    }

    /// Asks the orchestrator to route this and later requests through another
    /// upstream proxy. Applied right after the `request` hook returns.
    pub fn change_upstream_proxy(&mut self, address: Address) {
        self.upstream_proxy_change = Some(address);
    }

    pub(crate) fn take_upstream_proxy_change(&mut self) -> Option<Address> {
        self.upstream_proxy_change.take()
    }

    pub(crate) fn fail(&mut self, e: &ProxyError) {
        self.error = Some(FlowError::from(e));
    }
}
