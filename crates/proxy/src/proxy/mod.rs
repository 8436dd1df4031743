//! The per-connection HTTP proxy loop.
//!
//! [`HttpProxy`] drives one client connection over a stack of layer frames.
//! The bottom frame runs in the configured mode against the real server
//! connection. A successful CONNECT chained through an upstream proxy pushes
//! a frame whose server handle is a [`TunnelConnection`] over that same
//! connection; the frame runs in transparent mode with the tunnel target as
//! its destination.

mod connect;
mod http_layer;
mod server;

pub use http_layer::send_error;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::connection::{ClientConnection, Handoff, NextLayer, ServerConnection, TunnelConnection, TunnelState};
use crate::hooks::Hooks;
use crate::mode::HttpMode;
use crate::protocol::ProxyError;
use http_layer::{HttpLayer, LayerExit};

/// How [`HttpProxy::process`] left the connection.
#[derive(Debug)]
pub enum ConnectionExit {
    /// The client went away or the connection must be closed.
    Closed,
    /// Another protocol takes over from here.
    Handoff(Handoff),
}

#[derive(Debug)]
struct Frame {
    mode: HttpMode,
    tunnel: Option<TunnelState>,
}

#[derive(Clone)]
pub struct HttpProxy {
    config: Arc<ProxyConfig>,
    hooks: Arc<Hooks>,
    next_layer: Arc<dyn NextLayer>,
}

impl HttpProxy {
    pub fn builder() -> HttpProxyBuilder {
        HttpProxyBuilder::new()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serves one client connection until it closes or is handed off, then
    /// runs the next layer on it.
    pub async fn serve<C, S>(&self, client: &mut C, server: &mut S) -> Result<(), ProxyError>
    where
        C: ClientConnection,
        S: ServerConnection,
    {
        match self.process(client, server).await? {
            ConnectionExit::Closed => {
                info!("finished process, connection shutdown");
                Ok(())
            }
            ConnectionExit::Handoff(handoff) => {
                debug!(kind = ?handoff.kind, "hand off connection to next layer");
                match handoff.tunnel().cloned() {
                    Some(mut state) => {
                        let mut tunnel = TunnelConnection::new(server, &mut state);
                        self.next_layer.run(handoff, client, &mut tunnel).await
                    }
                    None => self.next_layer.run(handoff, client, server).await,
                }
            }
        }
    }

    /// Runs the HTTP layer frames of one client connection.
    pub async fn process<C, S>(&self, client: &mut C, server: &mut S) -> Result<ConnectionExit, ProxyError>
    where
        C: ClientConnection,
        S: ServerConnection,
    {
        let mut frames = vec![Frame { mode: self.config.http_mode(), tunnel: None }];

        while let Some(frame) = frames.last_mut() {
            let exit = match frame.tunnel.as_mut() {
                None => HttpLayer::new(&mut *client, &mut *server, &self.config, &self.hooks, frame.mode).run().await?,
                Some(state) => {
                    let mut tunnel = TunnelConnection::new(&mut *server, state);
                    HttpLayer::new(&mut *client, &mut tunnel, &self.config, &self.hooks, frame.mode).run().await?
                }
            };

            match exit {
                LayerExit::Closed => return Ok(ConnectionExit::Closed),
                LayerExit::Handoff(kind, flow) => {
                    return Ok(ConnectionExit::Handoff(Handoff::new(kind, flow, frame.tunnel.take())));
                }
                LayerExit::Tunnel(state) => {
                    frames.push(Frame { mode: HttpMode::Transparent, tunnel: Some(state) });
                }
            }
        }
        Ok(ConnectionExit::Closed)
    }
}

impl fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxy").field("config", &self.config).field("hooks", &self.hooks).finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum HttpProxyBuildError {
    #[error("next layer must be set")]
    MissingNextLayer,
}

pub struct HttpProxyBuilder {
    config: Arc<ProxyConfig>,
    hooks: Arc<Hooks>,
    next_layer: Option<Arc<dyn NextLayer>>,
}

impl HttpProxyBuilder {
    fn new() -> Self {
        Self { config: Arc::new(ProxyConfig::default()), hooks: Arc::new(Hooks::empty()), next_layer: None }
    }

    pub fn config<T: Into<Arc<ProxyConfig>>>(mut self, config: T) -> Self {
        self.config = config.into();
        self
    }

    pub fn hooks<T: Into<Arc<Hooks>>>(mut self, hooks: T) -> Self {
        self.hooks = hooks.into();
        self
    }

    pub fn next_layer(mut self, next_layer: Arc<dyn NextLayer>) -> Self {
        self.next_layer = Some(next_layer);
        self
    }

    pub fn build(self) -> Result<HttpProxy, HttpProxyBuildError> {
        let next_layer = self.next_layer.ok_or(HttpProxyBuildError::MissingNextLayer)?;
        Ok(HttpProxy { config: self.config, hooks: self.hooks, next_layer })
    }
}

impl fmt::Debug for HttpProxyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxyBuilder")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("next_layer", &self.next_layer.is_some())
            .finish()
    }
}
