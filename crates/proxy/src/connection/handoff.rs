//! Handing a connection over to the next protocol layer.

use async_trait::async_trait;

use crate::connection::{ClientConnection, ServerConnection, TunnelState};
use crate::protocol::{Flow, ProxyError};

/// Why the HTTP layer stopped speaking HTTP on a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandoffKind {
    /// A CONNECT tunnel was established; the bytes that follow belong to the
    /// tunneled target.
    Tunnel,
    /// A `101` completed a WebSocket handshake.
    WebSocket,
    /// A `101` switched to some other protocol.
    NextProtocol,
}

/// The connection state handed to the next protocol layer.
#[derive(Debug)]
pub struct Handoff {
    pub kind: HandoffKind,
    /// The exchange that triggered the handoff.
    pub flow: Flow,
    pub(crate) tunnel: Option<TunnelState>,
}

impl Handoff {
    pub(crate) fn new(kind: HandoffKind, flow: Flow, tunnel: Option<TunnelState>) -> Self {
        Self { kind, flow, tunnel }
    }

    /// The upstream CONNECT tunnel the handoff happened in, if any.
    pub fn tunnel(&self) -> Option<&TunnelState> {
        self.tunnel.as_ref()
    }
}

/// Whatever takes over a connection once the HTTP layer hands it off:
/// a TLS interceptor, a raw TCP relay or a WebSocket framer.
#[async_trait]
pub trait NextLayer: Send + Sync {
    async fn run(
        &self,
        handoff: Handoff,
        client: &mut dyn ClientConnection,
        server: &mut dyn ServerConnection,
    ) -> Result<(), ProxyError>;
}
