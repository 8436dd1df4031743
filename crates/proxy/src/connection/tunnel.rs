//! The server side of a CONNECT tunnel opened through an upstream proxy.

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use tracing::debug;

use crate::connection::ServerConnection;
use crate::protocol::{Address, BodyStream, ProxyError, Request, Response};

/// What a tunnel needs to remember between exchanges: the CONNECT request
/// that opens it and the target it reaches.
#[derive(Debug, Clone)]
pub struct TunnelState {
    connect_request: Request,
    address: Address,
}

impl TunnelState {
    pub fn new(connect_request: Request) -> Self {
        let address = connect_request.address();
        Self { connect_request, address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn connect_request(&self) -> &Request {
        &self.connect_request
    }

    fn retarget(&mut self, address: Address) {
        self.connect_request.host.clone_from(&address.host);
        self.connect_request.port = address.port;
        self.connect_request.authority = address.to_string();
        self.address = address;
    }
}

/// A server connection that lives inside a CONNECT tunnel.
///
/// It reports the tunnel target as its address while every read, write and
/// connection-state query goes to `via`, the real connection to the upstream
/// proxy. Connecting reopens the tunnel when the real connection was lost.
#[derive(Debug)]
pub struct TunnelConnection<'a, S> {
    via: &'a mut S,
    state: &'a mut TunnelState,
}

impl<'a, S> TunnelConnection<'a, S>
where
    S: ServerConnection,
{
    pub fn new(via: &'a mut S, state: &'a mut TunnelState) -> Self {
        Self { via, state }
    }

    pub fn via(&self) -> &S {
        self.via
    }

    async fn send_connect_request(&mut self) -> Result<(), ProxyError> {
        debug!(
            proxy = ?self.via.address(),
            tunnel = %self.state.address,
            "sending CONNECT request"
        );
        self.via.send_request(&self.state.connect_request).await?;
        let response = self.via.read_response(&self.state.connect_request).await?;
        if response.status != StatusCode::OK {
            return Err(ProxyError::protocol("Reconnect: Upstream server refuses CONNECT request"));
        }
        Ok(())
    }
}

#[async_trait]
impl<S> ServerConnection for TunnelConnection<'_, S>
where
    S: ServerConnection,
{
    fn address(&self) -> Option<&Address> {
        Some(&self.state.address)
    }

    fn tls_enabled(&self) -> bool {
        self.via.tls_enabled()
    }

    fn is_connected(&self) -> bool {
        self.via.is_connected()
    }

    fn set_address(&mut self, address: Address) {
        self.state.retarget(address);
    }

    fn set_tls(&mut self, tls: bool, sni: Option<&str>) {
        self.via.set_tls(tls, sni);
    }

    fn set_via_socks(&mut self, enabled: bool) {
        self.via.set_via_socks(enabled);
    }

    async fn connect(&mut self) -> Result<(), ProxyError> {
        if self.via.is_connected() {
            return Ok(());
        }
        self.via.connect().await?;
        self.send_connect_request().await
    }

    async fn disconnect(&mut self) -> Result<(), ProxyError> {
        self.via.disconnect().await
    }

    async fn send_request_headers(&mut self, request: &Request) -> Result<(), ProxyError> {
        self.via.send_request_headers(request).await
    }

    async fn send_request_body(&mut self, request: &Request, chunks: BodyStream<'_>) -> Result<(), ProxyError> {
        self.via.send_request_body(request, chunks).await
    }

    async fn send_request_trailers(&mut self, request: &Request) -> Result<(), ProxyError> {
        self.via.send_request_trailers(request).await
    }

    async fn read_response_headers(&mut self) -> Result<Response, ProxyError> {
        self.via.read_response_headers().await
    }

    fn read_response_body<'b>(&'b mut self, request: &Request, response: &Response) -> BodyStream<'b> {
        self.via.read_response_body(request, response)
    }

    async fn read_response_trailers(
        &mut self,
        request: &Request,
        response: &Response,
    ) -> Result<Option<HeaderMap>, ProxyError> {
        self.via.read_response_trailers(request, response).await
    }

    /// Changing the upstream proxy rebinds the real connection; the tunnel is
    /// reopened through the new proxy on the next connect.
    async fn change_upstream_proxy(&mut self, address: Address) -> Result<(), ProxyError> {
        debug!(proxy = %address, "changing upstream proxy (CONNECTed)");
        self.via.change_upstream_proxy(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeServer;

    fn state() -> TunnelState {
        TunnelState::new(Request::authority("example.com", 443))
    }

    #[tokio::test]
    async fn connect_opens_tunnel_once() {
        let mut real = FakeServer::new(Address::new("proxy.local", 3128));
        real.push_response(Response::new(StatusCode::OK).with_content(""));
        let mut state = state();

        let mut tunnel = TunnelConnection::new(&mut real, &mut state);
        assert_eq!(tunnel.address(), Some(&Address::new("example.com", 443)));
        assert!(!tunnel.is_connected());

        tunnel.connect().await.unwrap();
        assert!(tunnel.is_connected());
        tunnel.connect().await.unwrap();

        assert_eq!(real.connects, 1);
        assert_eq!(real.sent_requests.len(), 1);
        assert_eq!(real.sent_requests[0].authority, "example.com:443");
    }

    #[tokio::test]
    async fn refused_connect_is_a_protocol_error() {
        let mut real = FakeServer::new(Address::new("proxy.local", 3128));
        real.push_response(Response::new(StatusCode::FORBIDDEN).with_content(""));
        let mut state = state();

        let mut tunnel = TunnelConnection::new(&mut real, &mut state);
        let err = tunnel.connect().await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol { .. }));
    }

    #[tokio::test]
    async fn retarget_rewrites_connect_request() {
        let mut real = FakeServer::new(Address::new("proxy.local", 3128));
        let mut state = state();

        let mut tunnel = TunnelConnection::new(&mut real, &mut state);
        tunnel.set_address(Address::new("other.example", 8443));
        assert_eq!(tunnel.address(), Some(&Address::new("other.example", 8443)));
        assert_eq!(tunnel.via().address(), Some(&Address::new("proxy.local", 3128)));

        assert_eq!(state.connect_request().authority, "other.example:8443");
        assert_eq!(state.connect_request().port, 8443);
    }

    #[tokio::test]
    async fn upstream_change_rebinds_the_real_connection() {
        let mut real = FakeServer::new(Address::new("proxy.local", 3128));
        real.connected = true;
        let mut state = state();

        let mut tunnel = TunnelConnection::new(&mut real, &mut state);
        tunnel.change_upstream_proxy(Address::new("proxy2.local", 3128)).await.unwrap();
        assert_eq!(tunnel.address(), Some(&Address::new("example.com", 443)));

        assert_eq!(real.address(), Some(&Address::new("proxy2.local", 3128)));
        assert!(!real.connected);
        assert_eq!(real.disconnects, 1);
    }
}
