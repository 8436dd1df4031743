//! Request and response value objects shared by the orchestrator, the hooks
//! and the transmission layer.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use http::header::{HOST, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};

use crate::protocol::ProxyError;

/// A lazy, single-pass sequence of body chunks.
pub type BodyStream<'a> = BoxStream<'a, Result<Bytes, ProxyError>>;

/// A policy-supplied rewrite applied to a body while it is being streamed.
pub type BodyTransform = Arc<dyn for<'a> Fn(BodyStream<'a>) -> BodyStream<'a> + Send + Sync>;

/// Wraps already materialized content as a one-chunk body.
pub fn once_body(bytes: Bytes) -> BodyStream<'static> {
    stream::once(async move { Ok(bytes) }).boxed()
}

/// Drains `chunks` into one contiguous buffer.
pub async fn collect_body(chunks: BodyStream<'_>) -> Result<Bytes, ProxyError> {
    let buf = chunks
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}

/// How a message body travels through the proxy.
#[derive(Clone, Default)]
pub enum BodyMode {
    /// Read completely before hooks see the message.
    #[default]
    Buffered,
    /// Forwarded chunk by chunk, never materialized.
    Streamed,
    /// Forwarded chunk by chunk through a transform.
    Transformed(BodyTransform),
}

impl BodyMode {
    pub fn transform<F>(f: F) -> Self
    where
        F: for<'a> Fn(BodyStream<'a>) -> BodyStream<'a> + Send + Sync + 'static,
    {
        BodyMode::Transformed(Arc::new(f))
    }

    #[inline]
    pub fn is_streaming(&self) -> bool {
        !matches!(self, BodyMode::Buffered)
    }

    /// Routes `chunks` through the transform, if there is one.
    pub fn apply<'a>(&self, chunks: BodyStream<'a>) -> BodyStream<'a> {
        match self {
            BodyMode::Transformed(transform) => transform(chunks),
            BodyMode::Buffered | BodyMode::Streamed => chunks,
        }
    }
}

impl fmt::Debug for BodyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyMode::Buffered => f.write_str("Buffered"),
            BodyMode::Streamed => f.write_str("Streamed"),
            BodyMode::Transformed(_) => f.write_str("Transformed(..)"),
        }
    }
}

/// A `host:port` pair naming one end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| ProxyError::http(format!("missing port in {s}")))?;
        let port = port.parse::<u16>().map_err(|e| ProxyError::http(format!("invalid port in {s}: {e}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        crate::ensure!(!host.is_empty(), ProxyError::http(format!("missing host in {s}")));
        Ok(Address::new(host, port))
    }
}

/// The three request-target shapes of RFC 7230, section 5.3.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestForm {
    /// `GET /index.html`
    Relative,
    /// `GET http://example.com/index.html`
    Absolute,
    /// `CONNECT example.com:443`
    Authority,
}

impl RequestForm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestForm::Relative => "relative",
            RequestForm::Absolute => "absolute",
            RequestForm::Authority => "authority",
        }
    }
}

impl fmt::Display for RequestForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 }
}

/// An HTTP request as seen by the proxy.
///
/// Hooks may rewrite any field until the request is sent upstream. The
/// addressing form is not stored: it follows from the method and the
/// authority, see [`Request::first_line_form`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub authority: String,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// `None` while the body is streamed instead of materialized.
    pub content: Option<Bytes>,
    pub trailers: Option<HeaderMap>,
    pub timestamp_start: SystemTime,
    pub timestamp_end: Option<SystemTime>,
    pub stream: BodyMode,
}

impl Request {
    fn new(method: Method, scheme: &str, host: &str, port: u16, authority: String, path: String) -> Self {
        Self {
            method,
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            authority,
            path,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content: Some(Bytes::new()),
            trailers: None,
            timestamp_start: SystemTime::now(),
            timestamp_end: None,
            stream: BodyMode::Buffered,
        }
    }

    /// An origin-form request, the shape clients send to a transparent proxy.
    pub fn relative(method: Method, path: &str) -> Self {
        Self::new(method, "http", "", 80, String::new(), path.to_string())
    }

    /// A `CONNECT host:port` request.
    pub fn authority(host: &str, port: u16) -> Self {
        let authority = Address::new(host, port).to_string();
        Self::new(Method::CONNECT, "http", host, port, authority, String::new())
    }

    /// An absolute-form request parsed from `uri`.
    pub fn absolute(method: Method, uri: &str) -> Result<Self, ProxyError> {
        let uri = uri.parse::<Uri>().map_err(|e| ProxyError::http(format!("invalid uri {uri}: {e}")))?;
        let scheme = uri.scheme_str().ok_or_else(|| ProxyError::http("absolute-form without scheme"))?;
        let host = uri.host().ok_or_else(|| ProxyError::http("absolute-form without host"))?;
        let port = uri.port_u16().unwrap_or_else(|| default_port(scheme));
        let authority = uri.authority().map(ToString::to_string).unwrap_or_default();
        let path = uri.path_and_query().map_or_else(|| "/".to_string(), ToString::to_string);
        Ok(Self::new(method, scheme, host, port, authority, path))
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_content<B: Into<Bytes>>(mut self, content: B) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_stream(mut self, stream: BodyMode) -> Self {
        self.stream = stream;
        self
    }

    pub fn first_line_form(&self) -> RequestForm {
        if self.method == Method::CONNECT {
            RequestForm::Authority
        } else if !self.authority.is_empty() {
            RequestForm::Absolute
        } else {
            RequestForm::Relative
        }
    }

    #[inline]
    pub fn is_http2(&self) -> bool {
        self.version == Version::HTTP_2
    }

    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }

    pub fn host_header(&self) -> Option<&str> {
        self.headers.get(HOST).and_then(|value| value.to_str().ok())
    }

    /// Replaces the `Host` header, or the authority for HTTP/2 where the
    /// `:authority` pseudo-header plays that role.
    pub fn set_host_header(&mut self, host: &str) -> Result<(), ProxyError> {
        if self.is_http2() {
            self.authority = host.to_string();
            return Ok(());
        }
        let value = HeaderValue::from_str(host).map_err(|e| ProxyError::http(format!("invalid host header: {e}")))?;
        self.headers.insert(HOST, value);
        Ok(())
    }

    pub fn url(&self) -> String {
        if self.first_line_form() == RequestForm::Authority {
            return self.authority.clone();
        }
        let port = if self.port == default_port(&self.scheme) { String::new() } else { format!(":{}", self.port) };
        format!("{}://{}{}{}", self.scheme, self.host, port, self.path)
    }
}

/// An HTTP response as seen by the proxy.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    /// `None` while the body is streamed instead of materialized.
    pub content: Option<Bytes>,
    pub trailers: Option<HeaderMap>,
    pub timestamp_start: SystemTime,
    pub timestamp_end: Option<SystemTime>,
    pub stream: BodyMode,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content: None,
            trailers: None,
            timestamp_start: SystemTime::now(),
            timestamp_end: None,
            stream: BodyMode::Buffered,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_content<B: Into<Bytes>>(mut self, content: B) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_trailers(mut self, trailers: HeaderMap) -> Self {
        self.trailers = Some(trailers);
        self
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason.as_deref().or_else(|| self.status.canonical_reason()).unwrap_or("Unknown")
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
