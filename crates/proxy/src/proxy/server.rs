//! Binding the server handle to the right upstream.

use http::StatusCode;
use tracing::debug;

use crate::connection::{ClientConnection, ServerConnection};
use crate::ensure;
use crate::hooks::HookEvent;
use crate::mode::HttpMode;
use crate::protocol::{Address, Flow, ProxyError};
use crate::proxy::http_layer::{HttpLayer, Step};

impl<C, S> HttpLayer<'_, C, S>
where
    C: ClientConnection,
    S: ServerConnection,
{
    /// Makes sure the server handle is connected to where `host:port` should
    /// be reached from this mode.
    ///
    /// Regular and transparent mode talk to the origin and rebind whenever
    /// the target or its TLS setting differs from the current binding.
    /// Upstream mode always talks to the upstream proxy, which only speaks
    /// plain HTTP for non-CONNECT requests.
    pub(super) async fn establish_server_connection(
        &mut self,
        host: &str,
        port: u16,
        scheme: &str,
    ) -> Result<(), ProxyError> {
        let tls = scheme == "https";

        match self.mode {
            HttpMode::Regular | HttpMode::Transparent => {
                let address = Address::new(host, port);
                if self.server.address() != Some(&address) || self.server.tls_enabled() != tls {
                    self.set_server(address).await?;
                    self.server.set_tls(tls, Some(host));
                }
                if !self.server.is_connected() {
                    self.server.connect().await?;
                }
            }
            HttpMode::Upstream => {
                if !self.server.is_connected() {
                    self.server.connect().await?;
                }
                ensure!(!tls, ProxyError::protocol("Cannot change scheme in upstream proxy mode."));
            }
        }
        Ok(())
    }

    /// Rebinds the server handle, dropping the current connection first.
    pub(super) async fn set_server(&mut self, address: Address) -> Result<(), ProxyError> {
        if self.server.is_connected() {
            self.server.disconnect().await?;
        }
        debug!(address = %address, "set new server address");
        self.server.set_address(address);
        Ok(())
    }

    /// Sends the request through the current upstream, reconnecting once if
    /// the connection turned out to be dead.
    ///
    /// Returns a step when the failure was already answered to the client.
    pub(super) async fn get_response_with_retry(&mut self, flow: &mut Flow) -> Result<Option<Step>, ProxyError> {
        let e = match self.get_response(flow).await {
            Ok(()) => return Ok(None),
            Err(e) if e.is_network() || matches!(e, ProxyError::Http2Protocol { .. }) => e,
            Err(e) => return Err(e),
        };
        debug!(cause = %e, "server communication error");

        if matches!(e, ProxyError::Http2Protocol { .. }) {
            return Err(ProxyError::protocol("First and only attempt to get response via HTTP2 failed."));
        }

        // part of the body may already be gone, a retry would send a truncated request
        if flow.request()?.stream.is_streaming() {
            self.send_error(StatusCode::REQUEST_TIMEOUT, "Request Timeout", None).await;
            flow.fail(&e);
            self.hooks.ask(HookEvent::Error, flow);
            return Ok(Some(Step::Stop));
        }

        self.server.disconnect().await?;
        self.server.connect().await?;
        self.get_response(flow).await?;
        Ok(None)
    }

    /// Sends requests matching `no_proxy` straight to their origin and
    /// serves the rest of this layer in regular mode.
    pub(super) async fn bypass_upstream(&mut self, flow: &mut Flow) -> Result<(), ProxyError> {
        let via_proxy = self.mode == HttpMode::Upstream || self.config.mode.is_socks();
        let request = flow.request()?;
        if !via_proxy || !self.config.matches_no_proxy(request) {
            return Ok(());
        }

        let address = request.address();
        debug!(address = %address, "bypass upstream proxy");
        self.set_server(address).await?;
        self.server.set_via_socks(false);
        self.mode = HttpMode::Regular;
        flow.mode = self.mode;
        Ok(())
    }

    pub(super) async fn change_upstream_proxy(&mut self, address: Address) -> Result<(), ProxyError> {
        debug!(proxy = %address, "change upstream proxy");
        self.server.change_upstream_proxy(address).await
    }
}
