//! Scripted in-memory transmission used by the unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use http::HeaderMap;

use crate::connection::{ClientConnection, Handoff, HandoffKind, NextLayer, ServerConnection};
use crate::protocol::{Address, BodyStream, Flow, ProxyError, Request, Response, collect_body};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).with_test_writer().try_init();
}

fn chunks_of(content: Option<Bytes>) -> Vec<Bytes> {
    content.into_iter().filter(|content| !content.is_empty()).collect()
}

fn chunk_stream(chunks: Vec<Bytes>) -> BodyStream<'static> {
    stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// A client that sends scripted requests and records every response.
#[derive(Debug, Default)]
pub(crate) struct FakeClient {
    pub address: Option<Address>,
    pub tls: bool,
    requests: VecDeque<(Request, Vec<Bytes>)>,
    body: Vec<Bytes>,
    /// Responses as they went out: headers, concatenated body, trailers.
    pub sent: Vec<Response>,
    pub fail_sends: bool,
    pub close_after: bool,
}

impl FakeClient {
    pub fn new() -> Self {
        Self { address: Some(Address::new("127.0.0.1", 50000)), ..Self::default() }
    }

    /// Queues `request`; its `content`, if any, becomes the body the client sends.
    pub fn push_request(&mut self, mut request: Request) {
        let body = chunks_of(request.content.take());
        self.push_request_chunks(request, body);
    }

    pub fn push_request_chunks(&mut self, request: Request, chunks: Vec<Bytes>) {
        self.requests.push_back((request, chunks));
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// The final responses, interim `1xx` answers skipped.
    pub fn final_responses(&self) -> Vec<&Response> {
        self.sent.iter().filter(|response| !response.status.is_informational()).collect()
    }

    fn sending(&self) -> Result<(), ProxyError> {
        if self.fail_sends {
            return Err(ProxyError::network(io::Error::new(io::ErrorKind::BrokenPipe, "client went away")));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientConnection for FakeClient {
    fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    fn tls_established(&self) -> bool {
        self.tls
    }

    async fn read_request_headers(&mut self) -> Result<Request, ProxyError> {
        let (request, body) = self.requests.pop_front().ok_or(ProxyError::Disconnect)?;
        self.body = body;
        Ok(request)
    }

    fn read_request_body<'a>(&'a mut self, _request: &Request) -> BodyStream<'a> {
        chunk_stream(std::mem::take(&mut self.body))
    }

    async fn read_request_trailers(&mut self, _request: &Request) -> Result<Option<HeaderMap>, ProxyError> {
        Ok(None)
    }

    async fn send_response_headers(&mut self, response: &Response) -> Result<(), ProxyError> {
        self.sending()?;
        let mut head = response.clone();
        head.content = None;
        head.trailers = None;
        self.sent.push(head);
        Ok(())
    }

    async fn send_response_body(&mut self, _response: &Response, chunks: BodyStream<'_>) -> Result<(), ProxyError> {
        self.sending()?;
        let body = collect_body(chunks).await?;
        if let Some(last) = self.sent.last_mut() {
            last.content = Some(body);
        }
        Ok(())
    }

    async fn send_response_trailers(&mut self, response: &Response) -> Result<(), ProxyError> {
        self.sending()?;
        if let Some(last) = self.sent.last_mut() {
            last.trailers.clone_from(&response.trailers);
        }
        Ok(())
    }

    fn check_close_connection(&self, _flow: &Flow) -> bool {
        self.close_after
    }
}

/// An upstream connection answering from a script and recording what it was
/// asked to do.
#[derive(Debug, Default)]
pub(crate) struct FakeServer {
    address: Option<Address>,
    pub tls: bool,
    pub sni: Option<String>,
    pub via_socks: bool,
    pub connected: bool,
    pub connects: usize,
    pub disconnects: usize,
    responses: VecDeque<(Response, Vec<Bytes>, Option<HeaderMap>)>,
    body: Vec<Bytes>,
    trailers: Option<HeaderMap>,
    sends: usize,
    failing_sends: Vec<(usize, fn() -> ProxyError)>,
    /// Requests as they went out, body included.
    pub sent_requests: Vec<Request>,
    pub events: Vec<String>,
}

impl FakeServer {
    pub fn new(address: Address) -> Self {
        Self { address: Some(address), via_socks: true, ..Self::default() }
    }

    pub fn unbound() -> Self {
        Self { via_socks: true, ..Self::default() }
    }

    /// Queues `response`; its `content` becomes the body and its `trailers`
    /// the trailers the server sends.
    pub fn push_response(&mut self, mut response: Response) {
        let body = chunks_of(response.content.take());
        self.push_response_chunks(response, body);
    }

    pub fn push_response_chunks(&mut self, mut response: Response, chunks: Vec<Bytes>) {
        let trailers = response.trailers.take();
        self.responses.push_back((response, chunks, trailers));
    }

    /// Makes the `nth` call of `send_request_headers`, counted from zero,
    /// fail with a connection reset.
    pub fn fail_send(&mut self, nth: usize) {
        self.fail_send_with(nth, || {
            ProxyError::network(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
        });
    }

    /// Makes the `nth` call of `send_request_headers` fail with `error()`.
    pub fn fail_send_with(&mut self, nth: usize, error: fn() -> ProxyError) {
        self.failing_sends.push((nth, error));
    }
}

#[async_trait]
impl ServerConnection for FakeServer {
    fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    fn tls_enabled(&self) -> bool {
        self.tls
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_address(&mut self, address: Address) {
        self.events.push(format!("set_address {address}"));
        self.address = Some(address);
    }

    fn set_tls(&mut self, tls: bool, sni: Option<&str>) {
        self.tls = tls;
        self.sni = sni.map(ToString::to_string);
    }

    fn set_via_socks(&mut self, enabled: bool) {
        self.via_socks = enabled;
    }

    async fn connect(&mut self) -> Result<(), ProxyError> {
        let address = self.address.as_ref().map(ToString::to_string).unwrap_or_default();
        self.events.push(format!("connect {address}"));
        self.connected = true;
        self.connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProxyError> {
        self.events.push("disconnect".to_string());
        self.connected = false;
        self.disconnects += 1;
        Ok(())
    }

    async fn send_request_headers(&mut self, request: &Request) -> Result<(), ProxyError> {
        let nth = self.sends;
        self.sends += 1;
        if let Some((_, error)) = self.failing_sends.iter().find(|(failing, _)| *failing == nth) {
            return Err(error());
        }
        if !self.connected {
            return Err(ProxyError::network(io::Error::new(io::ErrorKind::NotConnected, "not connected")));
        }
        let mut head = request.clone();
        head.content = None;
        self.sent_requests.push(head);
        Ok(())
    }

    async fn send_request_body(&mut self, _request: &Request, chunks: BodyStream<'_>) -> Result<(), ProxyError> {
        let body = collect_body(chunks).await?;
        if let Some(last) = self.sent_requests.last_mut() {
            last.content = Some(body);
        }
        Ok(())
    }

    async fn send_request_trailers(&mut self, _request: &Request) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn read_response_headers(&mut self) -> Result<Response, ProxyError> {
        let (response, body, trailers) = self
            .responses
            .pop_front()
            .ok_or_else(|| ProxyError::network(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed")))?;
        self.body = body;
        self.trailers = trailers;
        Ok(response)
    }

    fn read_response_body<'a>(&'a mut self, _request: &Request, _response: &Response) -> BodyStream<'a> {
        chunk_stream(std::mem::take(&mut self.body))
    }

    async fn read_response_trailers(
        &mut self,
        _request: &Request,
        _response: &Response,
    ) -> Result<Option<HeaderMap>, ProxyError> {
        Ok(self.trailers.take())
    }
}

/// Records every handoff together with the server address it was given.
#[derive(Debug, Default)]
pub(crate) struct RecordingNextLayer {
    pub handoffs: Mutex<Vec<(HandoffKind, Option<Address>)>>,
}

impl RecordingNextLayer {
    pub fn kinds(&self) -> Vec<HandoffKind> {
        self.handoffs.lock().map(|handoffs| handoffs.iter().map(|(kind, _)| *kind).collect()).unwrap_or_default()
    }
}

#[async_trait]
impl NextLayer for RecordingNextLayer {
    async fn run(
        &self,
        handoff: Handoff,
        _client: &mut dyn ClientConnection,
        server: &mut dyn ServerConnection,
    ) -> Result<(), ProxyError> {
        if let Ok(mut handoffs) = self.handoffs.lock() {
            handoffs.push((handoff.kind, server.address().cloned()));
        }
        Ok(())
    }
}
