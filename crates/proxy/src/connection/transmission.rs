//! The transmission contract the HTTP layer drives.
//!
//! Both halves are async traits so they can be used as trait objects by the
//! next layer after a handoff.

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use crate::protocol::{Address, BodyStream, Flow, ProxyError, Request, Response, collect_body, once_body};

/// The client-facing half of the transmission layer.
///
/// Implementations own the wire format (HTTP/1 framing, HTTP/2 streams, TLS)
/// and hand the orchestrator parsed messages. Bodies are exposed as lazy
/// streams so a streamed body never has to fit in memory.
#[async_trait]
pub trait ClientConnection: Send {
    fn address(&self) -> Option<&Address>;

    fn tls_established(&self) -> bool;

    /// Reads the next request head. A clean close before any byte of a new
    /// request surfaces as [`ProxyError::Disconnect`].
    async fn read_request_headers(&mut self) -> Result<Request, ProxyError>;

    fn read_request_body<'a>(&'a mut self, request: &Request) -> BodyStream<'a>;

    async fn read_request_trailers(&mut self, request: &Request) -> Result<Option<HeaderMap>, ProxyError>;

    async fn send_response_headers(&mut self, response: &Response) -> Result<(), ProxyError>;

    async fn send_response_body(&mut self, response: &Response, chunks: BodyStream<'_>) -> Result<(), ProxyError>;

    /// Sends `response.trailers`, if the protocol supports them.
    async fn send_response_trailers(&mut self, response: &Response) -> Result<(), ProxyError>;

    /// Whether the connection must be closed once `flow` has been answered.
    fn check_close_connection(&self, flow: &Flow) -> bool;

    /// Sends a fully materialized response in one go.
    async fn send_response(&mut self, response: &Response) -> Result<(), ProxyError> {
        let Some(content) = response.content.clone() else {
            return Err(ProxyError::protocol("Cannot assemble flow with missing content"));
        };
        self.send_response_headers(response).await?;
        self.send_response_body(response, once_body(content)).await?;
        self.send_response_trailers(response).await
    }
}

/// The server-facing half of the transmission layer: one rebindable upstream
/// connection.
///
/// The handle keeps its target between exchanges. [`set_address`] and
/// [`set_tls`] only record a new target; callers disconnect first and
/// [`connect`] later.
///
/// [`set_address`]: ServerConnection::set_address
/// [`set_tls`]: ServerConnection::set_tls
/// [`connect`]: ServerConnection::connect
#[async_trait]
pub trait ServerConnection: Send {
    fn address(&self) -> Option<&Address>;

    /// Whether this connection is, or will be, wrapped in TLS.
    fn tls_enabled(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn set_address(&mut self, address: Address);

    fn set_tls(&mut self, tls: bool, sni: Option<&str>);

    /// Routes the connection through the configured SOCKS proxy or not.
    fn set_via_socks(&mut self, _enabled: bool) {}

    async fn connect(&mut self) -> Result<(), ProxyError>;

    async fn disconnect(&mut self) -> Result<(), ProxyError>;

    async fn send_request_headers(&mut self, request: &Request) -> Result<(), ProxyError>;

    async fn send_request_body(&mut self, request: &Request, chunks: BodyStream<'_>) -> Result<(), ProxyError>;

    async fn send_request_trailers(&mut self, request: &Request) -> Result<(), ProxyError>;

    async fn read_response_headers(&mut self) -> Result<Response, ProxyError>;

    fn read_response_body<'a>(&'a mut self, request: &Request, response: &Response) -> BodyStream<'a>;

    async fn read_response_trailers(
        &mut self,
        request: &Request,
        response: &Response,
    ) -> Result<Option<HeaderMap>, ProxyError>;

    /// Sends a request whose body is already materialized.
    async fn send_request(&mut self, request: &Request) -> Result<(), ProxyError> {
        self.send_request_headers(request).await?;
        let content = request.content.clone().unwrap_or_else(Bytes::new);
        self.send_request_body(request, once_body(content)).await?;
        self.send_request_trailers(request).await
    }

    /// Reads a complete response, body and trailers included.
    async fn read_response(&mut self, request: &Request) -> Result<Response, ProxyError> {
        let mut response = self.read_response_headers().await?;
        let content = collect_body(self.read_response_body(request, &response)).await?;
        response.content = Some(content);
        response.trailers = self.read_response_trailers(request, &response).await?;
        Ok(response)
    }

    /// Points this handle at another upstream proxy, reconnecting lazily.
    async fn change_upstream_proxy(&mut self, address: Address) -> Result<(), ProxyError> {
        if self.address() == Some(&address) {
            return Ok(());
        }
        if self.is_connected() {
            self.disconnect().await?;
        }
        self.set_address(address);
        Ok(())
    }
}
