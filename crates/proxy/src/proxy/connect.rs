//! CONNECT handling: terminating tunnels ourselves, or chaining them through
//! the upstream proxy.

use http::StatusCode;
use http::header::PROXY_AUTHORIZATION;
use tracing::{debug, error};

use crate::connection::{ClientConnection, HandoffKind, ServerConnection, TunnelState};
use crate::hooks::HookEvent;
use crate::mode::HttpMode;
use crate::protocol::responses::make_connect_response;
use crate::protocol::{Flow, ProxyError, Request};
use crate::proxy::http_layer::{HttpLayer, Step};

impl<C, S> HttpLayer<'_, C, S>
where
    C: ClientConnection,
    S: ServerConnection,
{
    pub(super) async fn handle_connect(&mut self, flow: &mut Flow) -> Result<Step, ProxyError> {
        match self.mode {
            HttpMode::Regular => Ok(self.handle_regular_connect(flow).await),
            HttpMode::Upstream => {
                self.apply_proxy_auth(flow.request_mut()?);
                self.handle_upstream_connect(flow).await
            }
            HttpMode::Transparent => {
                self.send_error(StatusCode::BAD_REQUEST, "Unexpected CONNECT request.", None).await;
                Ok(Step::Stop)
            }
        }
    }

    /// Answers the CONNECT ourselves and hands the connection to the next
    /// layer. Failures are answered with a `502`.
    async fn handle_regular_connect(&mut self, flow: &mut Flow) -> Step {
        match self.open_regular_tunnel(flow).await {
            Ok(step) => step,
            Err(e) => {
                self.send_error(StatusCode::BAD_GATEWAY, &e.to_string(), None).await;
                flow.fail(&e);
                self.hooks.ask(HookEvent::Error, flow);
                Step::Stop
            }
        }
    }

    async fn open_regular_tunnel(&mut self, flow: &mut Flow) -> Result<Step, ProxyError> {
        let request = flow.request()?;
        let (address, version) = (request.address(), request.version);
        let target = address.to_string();
        self.set_server(address).await?;

        let response = flow.response.get_or_insert_with(|| make_connect_response(version));
        self.client.send_response(response).await?;

        if response.is_success() {
            debug!(tunnel = %target, "tunnel established");
            return Ok(Step::Handoff(HandoffKind::Tunnel));
        }
        Ok(Step::Stop)
    }

    /// Forwards the CONNECT to the upstream proxy and relays its answer.
    ///
    /// On success the caller continues in a nested layer whose server handle
    /// is the tunnel. A hook-supplied response is relayed without contacting
    /// the upstream proxy.
    async fn handle_upstream_connect(&mut self, flow: &mut Flow) -> Result<Step, ProxyError> {
        if flow.response.is_none() {
            let request = flow.request()?;
            let (host, port, scheme) = (request.host.clone(), request.port, request.scheme.clone());
            self.establish_server_connection(&host, port, &scheme).await?;

            let request = flow.request()?;
            self.server.send_request(request).await?;
            let response = self.server.read_response(request).await?;
            flow.response = Some(response);
        }

        let response = flow.response()?;
        self.client.send_response(response).await?;

        if response.is_success() {
            let state = TunnelState::new(flow.request()?.clone());
            debug!(tunnel = %state.address(), "upstream tunnel established");
            return Ok(Step::Tunnel(state));
        }

        if response.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            let proxy = self.config.mode.upstream_server().map(ToString::to_string).unwrap_or_default();
            let username = self.config.upstream_username().unwrap_or_default().to_string();
            error!(proxy = %proxy, username = %username, "couldn't connect to upstream proxy");

            let e = ProxyError::Auth { proxy, username };
            flow.fail(&e);
            self.hooks.ask(HookEvent::Error, flow);
        }
        Ok(Step::Stop)
    }

    /// Attaches the configured upstream credentials to `request`.
    pub(super) fn apply_proxy_auth(&self, request: &mut Request) {
        if let Some(credential) = self.config.proxy_authorization() {
            request.headers.insert(PROXY_AUTHORIZATION, credential);
        }
    }
}
