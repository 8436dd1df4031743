//! One HTTP layer: the request/response loop over a client connection and a
//! server handle, in a single proxy mode.

use std::time::SystemTime;

use http::header::EXPECT;
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::connection::{ClientConnection, HandoffKind, ServerConnection, TunnelState};
use crate::hooks::{HookEvent, Hooks};
use crate::mode::{HttpMode, ModeSpec, validate_request_form};
use crate::protocol::responses::{make_error_response, make_expect_continue_response};
use crate::protocol::{
    Address, ConnectionInfo, Flow, ProxyError, Request, RequestForm, WEBSOCKET_METADATA_KEY, collect_body, once_body,
    websocket,
};

/// How one layer run ended.
#[derive(Debug)]
pub(crate) enum LayerExit {
    Closed,
    Handoff(HandoffKind, Flow),
    Tunnel(TunnelState),
}

/// What the loop does after one exchange.
#[derive(Debug)]
pub(super) enum Step {
    Continue,
    Stop,
    Handoff(HandoffKind),
    Tunnel(TunnelState),
}

/// Where redirected traffic was originally headed, captured when the layer
/// starts so hooks retargeting one request cannot leak into the next.
#[derive(Debug, Clone)]
struct InitialDestination {
    address: Address,
    tls: bool,
}

/// The exchange loop over one client connection and one server handle.
///
/// Each iteration reads a request, runs it past the hooks, forwards it (or
/// opens a tunnel) and delivers the response. The loop ends on disconnect,
/// on any error answered to the client, or when the connection is handed to
/// another protocol.
pub(crate) struct HttpLayer<'a, C, S> {
    pub(super) client: &'a mut C,
    pub(super) server: &'a mut S,
    pub(super) config: &'a ProxyConfig,
    pub(super) hooks: &'a Hooks,
    pub(super) mode: HttpMode,
    initial: Option<InitialDestination>,
}

impl<'a, C, S> HttpLayer<'a, C, S>
where
    C: ClientConnection,
    S: ServerConnection,
{
    pub(crate) fn new(
        client: &'a mut C,
        server: &'a mut S,
        config: &'a ProxyConfig,
        hooks: &'a Hooks,
        mode: HttpMode,
    ) -> Self {
        let initial = if mode == HttpMode::Transparent {
            server.address().cloned().map(|address| InitialDestination { address, tls: server.tls_enabled() })
        } else {
            None
        };
        Self { client, server, config, hooks, mode, initial }
    }

    pub(crate) async fn run(mut self) -> Result<LayerExit, ProxyError> {
        loop {
            let mut flow = Flow::new(self.client_info(), self.server_info(), self.mode);
            match self.process_exchange(&mut flow).await? {
                Step::Continue => {}
                Step::Stop => return Ok(LayerExit::Closed),
                Step::Handoff(kind) => return Ok(LayerExit::Handoff(kind, flow)),
                Step::Tunnel(state) => return Ok(LayerExit::Tunnel(state)),
            }
        }
    }

    async fn process_exchange(&mut self, flow: &mut Flow) -> Result<Step, ProxyError> {
        let result = self.process_flow(flow).await;
        flow.finish();
        result
    }

    async fn process_flow(&mut self, flow: &mut Flow) -> Result<Step, ProxyError> {
        match self.receive_request(flow).await {
            Ok(Some(step)) => return Ok(step),
            Ok(None) => {}
            // disconnects before or between requests are not errors
            Err(ProxyError::Disconnect) => return Ok(Step::Stop),
            Err(e) if e.is_client_error() => {
                self.reject_request(flow, &e).await;
                return Ok(Step::Stop);
            }
            Err(e) => return Err(e),
        }

        if let Ok(request) = flow.request() {
            debug!(method = %request.method, url = %request.url(), version = ?request.version, "receive request");
        }

        match self.forward(flow).await {
            Ok(step) => Ok(step),
            Err(e) => self.handle_forward_error(flow, e).await,
        }
    }

    /// Reads and validates the next request. Returns a step when the
    /// exchange is already settled, which is always the case for CONNECT.
    async fn receive_request(&mut self, flow: &mut Flow) -> Result<Option<Step>, ProxyError> {
        let request = self.client.read_request_headers().await?;
        flow.request = Some(request);

        self.bypass_upstream(flow).await?;

        if flow.request()?.first_line_form() == RequestForm::Authority {
            self.validate(flow.request()?)?;

            // a CONNECT body is unusual but legal
            let request = flow.request_mut()?;
            let content = collect_body(self.client.read_request_body(request)).await?;
            request.content = Some(content);
            request.trailers = self.client.read_request_trailers(request).await?;
            request.timestamp_end = Some(SystemTime::now());

            self.hooks.ask(HookEvent::HttpConnect, flow);
            return self.handle_connect(flow).await.map(Some);
        }

        self.validate(flow.request()?)?;
        self.hooks.ask(HookEvent::RequestHeaders, flow);

        if self.mode == HttpMode::Upstream {
            self.apply_proxy_auth(flow.request_mut()?);
        }

        // hooks may have rewritten the request target
        self.validate(flow.request()?)?;

        self.handle_expect_continue(flow.request_mut()?).await?;

        let request = flow.request_mut()?;
        if request.stream.is_streaming() {
            request.content = None;
        } else {
            let content = collect_body(self.client.read_request_body(request)).await?;
            request.content = Some(content);
        }
        request.trailers = self.client.read_request_trailers(request).await?;
        request.timestamp_end = Some(SystemTime::now());
        Ok(None)
    }

    fn validate(&self, request: &Request) -> Result<(), ProxyError> {
        if self.config.relax_http_form_validation {
            return Ok(());
        }
        validate_request_form(self.mode, request)
    }

    async fn handle_expect_continue(&mut self, request: &mut Request) -> Result<(), ProxyError> {
        let expects_continue =
            request.headers.get(EXPECT).is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"));
        if expects_continue {
            self.client.send_response(&make_expect_continue_response()).await?;
            request.headers.remove(EXPECT);
            debug!("receive expect request header, sent continue response");
        }
        Ok(())
    }

    async fn reject_request(&mut self, flow: &mut Flow, e: &ProxyError) {
        self.send_error(StatusCode::BAD_REQUEST, &e.to_string(), None).await;
        // the request may be malformed at this point
        flow.request = None;
        flow.fail(e);
        self.hooks.ask(HookEvent::Error, flow);

        if self.config.suppress_connection_errors {
            debug!(cause = %e, "HTTP protocol error in client request");
        } else {
            warn!(cause = %e, "HTTP protocol error in client request");
        }
    }

    async fn forward(&mut self, flow: &mut Flow) -> Result<Step, ProxyError> {
        self.normalize_request(flow.request_mut()?)?;

        self.hooks.ask(HookEvent::Request, flow);
        if let Some(address) = flow.take_upstream_proxy_change() {
            self.change_upstream_proxy(address).await?;
        }

        let headers = &flow.request()?.headers;
        if websocket::check_handshake(headers) && websocket::check_client_version(headers) {
            flow.metadata.insert(WEBSOCKET_METADATA_KEY.to_string(), Value::Bool(true));
            self.hooks.ask(HookEvent::WebsocketHandshake, flow);
        }

        let from_upstream = flow.response.is_none();
        if from_upstream {
            let request = flow.request()?;
            let (host, port, scheme) = (request.host.clone(), request.port, request.scheme.clone());
            self.establish_server_connection(&host, port, &scheme).await?;

            if let Some(step) = self.get_response_with_retry(flow).await? {
                return Ok(step);
            }

            // last chance for hooks to ask for a streamed response body
            self.hooks.ask(HookEvent::ResponseHeaders, flow);
            self.read_response_body(flow).await?;

            flow.server_conn = self.server_info();
        } else {
            self.hooks.ask(HookEvent::ResponseHeaders, flow);
        }

        if let Ok(response) = flow.response() {
            debug!(status = %response.status, version = ?response.version, "receive response");
        }
        self.hooks.ask(HookEvent::Response, flow);

        self.deliver_response(flow, from_upstream).await?;

        if self.client.check_close_connection(flow) {
            return Ok(Step::Stop);
        }

        let (request, response) = (flow.request()?, flow.response()?);
        if response.status == StatusCode::SWITCHING_PROTOCOLS {
            let is_websocket =
                websocket::check_handshake(&request.headers) && websocket::check_handshake(&response.headers);
            if is_websocket && !self.config.websocket {
                info!("client requested WebSocket connection, but the protocol is disabled");
            }
            let kind =
                if is_websocket && self.config.websocket { HandoffKind::WebSocket } else { HandoffKind::NextProtocol };
            return Ok(Step::Handoff(kind));
        }

        Ok(Step::Continue)
    }

    fn normalize_request(&self, request: &mut Request) -> Result<(), ProxyError> {
        // origin servers expect origin-form
        if self.mode == HttpMode::Regular && request.first_line_form() == RequestForm::Absolute {
            request.authority.clear();
        }

        if let ModeSpec::Reverse { address, .. } = &self.config.mode
            && !self.config.keep_host_header
        {
            request.set_host_header(&address.host)?;
        }

        // the Host header stays untouched
        if self.mode == HttpMode::Transparent {
            let initial = self
                .initial
                .as_ref()
                .ok_or_else(|| ProxyError::protocol("transparent mode without an original destination"))?;
            request.host.clone_from(&initial.address.host);
            request.port = initial.address.port;
            request.scheme = if initial.tls { "https" } else { "http" }.to_string();
        }
        Ok(())
    }

    /// Sends the request upstream and reads the response head.
    pub(super) async fn get_response(&mut self, flow: &mut Flow) -> Result<(), ProxyError> {
        let request = flow.request()?;
        self.server.send_request_headers(request).await?;
        if request.stream.is_streaming() {
            let chunks = self.client.read_request_body(request);
            self.server.send_request_body(request, request.stream.apply(chunks)).await?;
        } else {
            let content = request.content.clone().unwrap_or_default();
            self.server.send_request_body(request, once_body(content)).await?;
        }
        self.server.send_request_trailers(request).await?;

        let response = self.server.read_response_headers().await?;
        flow.response = Some(response);
        Ok(())
    }

    /// Materializes the upstream response body, unless hooks asked for it to
    /// be streamed.
    async fn read_response_body(&mut self, flow: &mut Flow) -> Result<(), ProxyError> {
        let Flow { request, response, .. } = flow;
        let request = request.as_ref().ok_or_else(|| ProxyError::protocol("flow has no request"))?;
        let response = response.as_mut().ok_or_else(|| ProxyError::protocol("flow has no response"))?;

        if response.stream.is_streaming() {
            response.content = None;
            return Ok(());
        }
        let content = collect_body(self.server.read_response_body(request, response)).await?;
        response.content = Some(content);
        response.trailers = self.server.read_response_trailers(request, response).await?;
        response.timestamp_end = Some(SystemTime::now());
        Ok(())
    }

    async fn deliver_response(&mut self, flow: &mut Flow, from_upstream: bool) -> Result<(), ProxyError> {
        let Flow { request, response, .. } = flow;
        let request = request.as_ref().ok_or_else(|| ProxyError::protocol("flow has no request"))?;
        let response = response.as_mut().ok_or_else(|| ProxyError::protocol("flow has no response"))?;

        // only a body left unread by `read_response_body` is streamed; hooks
        // flipping the stream mode afterwards cannot make it be read twice
        if !from_upstream || response.content.is_some() {
            return self.client.send_response(response).await;
        }

        self.client.send_response_headers(response).await?;
        let chunks = self.server.read_response_body(request, response);
        self.client.send_response_body(response, response.stream.apply(chunks)).await?;
        response.trailers = self.server.read_response_trailers(request, response).await?;
        response.timestamp_end = Some(SystemTime::now());
        self.client.send_response_trailers(response).await
    }

    async fn handle_forward_error(&mut self, flow: &mut Flow, e: ProxyError) -> Result<Step, ProxyError> {
        if flow.response.is_some() {
            return Err(ProxyError::protocol(format!("Error in HTTP connection: {e}")));
        }
        self.send_error(StatusCode::BAD_GATEWAY, &e.to_string(), None).await;
        flow.fail(&e);
        self.hooks.ask(HookEvent::Error, flow);
        Ok(Step::Stop)
    }

    pub(super) async fn send_error(&mut self, status: StatusCode, message: &str, headers: Option<HeaderMap>) {
        send_error(&mut *self.client, status, message, headers).await;
    }

    fn client_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(self.client.address().cloned(), self.client.tls_established())
    }

    pub(super) fn server_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(self.server.address().cloned(), self.server.tls_enabled())
    }
}

/// Answers the client with an error page. Delivery failures are logged and
/// swallowed; the connection is usually beyond saving at this point.
pub async fn send_error<C>(client: &mut C, status: StatusCode, message: &str, headers: Option<HeaderMap>)
where
    C: ClientConnection,
{
    let response = make_error_response(status, message, headers);
    if let Err(e) = client.send_response(&response).await {
        debug!(status = %status, detail = message, cause = %e, "failed to send error response to client");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::Method;

    use super::*;
    use crate::protocol::{BodyMode, Response};
    use crate::test_support::{FakeClient, FakeServer, init_tracing};

    async fn finished_exchange(client: &mut FakeClient, server: &mut FakeServer, hooks: &Hooks) -> (Step, Flow) {
        let config = ProxyConfig::default();
        let mut flow = Flow::new(ConnectionInfo::default(), ConnectionInfo::default(), HttpMode::Regular);
        let mut layer = HttpLayer::new(client, server, &config, hooks, HttpMode::Regular);
        let step = layer.process_exchange(&mut flow).await.unwrap();
        (step, flow)
    }

    fn get(uri: &str) -> Request {
        Request::absolute(Method::GET, uri).unwrap()
    }

    #[tokio::test]
    async fn flow_is_finished_after_a_delivered_response() {
        init_tracing();
        let mut client = FakeClient::new();
        client.push_request(get("http://example.com/"));
        let mut server = FakeServer::unbound();
        server.push_response(Response::new(StatusCode::OK).with_content("hello"));

        let (step, flow) = finished_exchange(&mut client, &mut server, &Hooks::empty()).await;
        assert!(matches!(step, Step::Continue));
        assert!(!flow.is_live());
        assert!(flow.error.is_none());
    }

    #[tokio::test]
    async fn flow_is_finished_after_a_rejected_request() {
        init_tracing();
        let mut client = FakeClient::new();
        client.push_request(Request::relative(Method::GET, "/"));
        let mut server = FakeServer::unbound();

        let (step, flow) = finished_exchange(&mut client, &mut server, &Hooks::empty()).await;
        assert!(matches!(step, Step::Stop));
        assert!(!flow.is_live());
        assert_eq!(client.sent[0].status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn flow_is_finished_after_a_bad_gateway() {
        init_tracing();
        let mut client = FakeClient::new();
        client.push_request(get("http://example.com/"));
        let mut server = FakeServer::unbound();
        server.fail_send(0);
        server.fail_send(1);

        let (step, flow) = finished_exchange(&mut client, &mut server, &Hooks::empty()).await;
        assert!(matches!(step, Step::Stop));
        assert!(!flow.is_live());
        assert!(flow.error.is_some());
        assert_eq!(client.sent[0].status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn flow_is_finished_after_a_request_timeout() {
        init_tracing();
        let hooks = Hooks::builder()
            .on(HookEvent::RequestHeaders, |flow| {
                if let Some(request) = flow.request.as_mut() {
                    request.stream = BodyMode::Streamed;
                }
            })
            .build();
        let mut client = FakeClient::new();
        client.push_request_chunks(
            Request::absolute(Method::POST, "http://example.com/upload").unwrap(),
            vec![Bytes::from_static(b"part")],
        );
        let mut server = FakeServer::unbound();
        server.fail_send(0);

        let (step, flow) = finished_exchange(&mut client, &mut server, &hooks).await;
        assert!(matches!(step, Step::Stop));
        assert!(!flow.is_live());
        assert_eq!(client.sent[0].status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn flow_is_finished_after_a_disconnect() {
        init_tracing();
        let mut client = FakeClient::new();
        let mut server = FakeServer::unbound();

        let (step, flow) = finished_exchange(&mut client, &mut server, &Hooks::empty()).await;
        assert!(matches!(step, Step::Stop));
        assert!(!flow.is_live());
        assert!(flow.request.is_none());
    }
}
