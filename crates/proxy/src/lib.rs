//! The HTTP core of an intercepting proxy
//!
//! This crate drives one client connection through a forward, transparent or
//! chained (upstream) HTTP proxy. It decides per exchange how the request is
//! addressed, whether it opens a tunnel, which upstream serves it, whether
//! bodies are buffered or streamed, when a dead upstream connection is retried
//! and when the connection is handed to another protocol. Policy code watches
//! and rewrites every exchange through [`hooks`].
//!
//! Wire framing and TLS live behind the [`connection::ClientConnection`] and
//! [`connection::ServerConnection`] traits; this crate never touches bytes on
//! the socket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use micro_proxy::config::ProxyConfig;
//! use micro_proxy::connection::{ClientConnection, NextLayer, ServerConnection};
//! use micro_proxy::hooks::{HookEvent, Hooks};
//! use micro_proxy::proxy::HttpProxy;
//! use tracing::info;
//!
//! async fn serve_one<C, S>(next_layer: Arc<dyn NextLayer>, client: &mut C, server: &mut S)
//! where
//!     C: ClientConnection,
//!     S: ServerConnection,
//! {
//!     let config = ProxyConfig::builder()
//!         .mode("upstream:http://proxy.local:3128")
//!         .no_proxy("internal:8080")
//!         .build()
//!         .unwrap();
//!     let hooks = Hooks::builder()
//!         .on(HookEvent::Request, |flow| {
//!             if let Some(request) = flow.request.as_mut() {
//!                 request.headers.remove("x-debug");
//!             }
//!         })
//!         .build();
//!
//!     let proxy = HttpProxy::builder().config(config).hooks(hooks).next_layer(next_layer).build().unwrap();
//!     if let Err(e) = proxy.serve(client, server).await {
//!         info!(cause = %e, "connection closed with error");
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`protocol`]: requests, responses, flows, errors and synthesized responses
//! - [`mode`]: proxy modes and request-form validation
//! - [`connection`]: the transmission contract, CONNECT tunnels and handoff
//! - [`hooks`]: named checkpoints for policy code
//! - [`config`]: options shared by every connection
//! - [`proxy`]: the exchange loop itself

pub mod config;
pub mod connection;
pub mod hooks;
pub mod mode;
pub mod protocol;
pub mod proxy;

mod utils;
pub(crate) use utils::ensure;

#[cfg(test)]
mod test_support;
