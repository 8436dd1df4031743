//! Read-mostly options shared by every connection the proxy serves.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderValue;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

use crate::ensure;
use crate::mode::{HttpMode, ModeSpec};
use crate::protocol::Request;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid proxy mode: {reason}")]
    InvalidMode { reason: String },

    #[error("invalid no_proxy entry: {reason}")]
    InvalidNoProxy { reason: String },

    #[error("invalid upstream credentials: {reason}")]
    InvalidAuth { reason: String },

    #[error("invalid configuration document: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid_mode<S: ToString>(str: S) -> Self {
        Self::InvalidMode { reason: str.to_string() }
    }

    pub fn invalid_no_proxy<S: ToString>(str: S) -> Self {
        Self::InvalidNoProxy { reason: str.to_string() }
    }

    pub fn invalid_auth<S: ToString>(str: S) -> Self {
        Self::InvalidAuth { reason: str.to_string() }
    }
}

/// One `host[:port]` entry of the upstream bypass list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoProxyEntry {
    pub host_suffix: String,
    pub port: Option<u16>,
}

impl FromStr for NoProxyEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| ConfigError::invalid_no_proxy(format!("{s}: {e}")))?;
                (host, Some(port))
            }
            None => (s, None),
        };
        ensure!(!host.is_empty(), ConfigError::invalid_no_proxy(format!("{s}: empty host")));
        Ok(Self { host_suffix: host.to_string(), port })
    }
}

impl fmt::Display for NoProxyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host_suffix, port),
            None => f.write_str(&self.host_suffix),
        }
    }
}

impl<'de> Deserialize<'de> for NoProxyEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Proxy options consumed by the HTTP layer.
///
/// Built either through [`ProxyConfig::builder`] or deserialized from JSON
/// with [`ProxyConfig::from_json`]; both paths validate the result.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub mode: ModeSpec,
    pub no_proxy: Vec<NoProxyEntry>,
    /// Keep the client's `Host` header in reverse mode.
    pub keep_host_header: bool,
    pub relax_http_form_validation: bool,
    pub websocket: bool,
    /// Log client protocol errors at debug instead of warn.
    pub suppress_connection_errors: bool,
    /// `username:password` for the upstream proxy.
    pub upstream_auth: Option<String>,
    /// A preformatted `Proxy-Authorization` value, preferred over `upstream_auth`.
    pub upstream_custom_auth: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ModeSpec::Regular,
            no_proxy: Vec::new(),
            keep_host_header: false,
            relax_http_form_validation: false,
            websocket: true,
            suppress_connection_errors: false,
            upstream_auth: None,
            upstream_custom_auth: None,
        }
    }
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::new()
    }

    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(auth) = &self.upstream_auth {
            ensure!(auth.contains(':'), ConfigError::invalid_auth("upstream_auth must be username:password"));
        }
        if let Some(custom) = &self.upstream_custom_auth {
            HeaderValue::from_str(custom).map_err(ConfigError::invalid_auth)?;
        }
        Ok(())
    }

    #[inline]
    pub fn http_mode(&self) -> HttpMode {
        self.mode.http_mode()
    }

    /// Whether `request` should bypass the upstream proxy.
    ///
    /// An entry matches when the request host ends with its host; an entry
    /// that names a port additionally needs the same port. The first matching
    /// entry wins.
    pub fn matches_no_proxy(&self, request: &Request) -> bool {
        self.no_proxy.iter().any(|entry| {
            request.host.ends_with(&entry.host_suffix) && entry.port.is_none_or(|port| port == request.port)
        })
    }

    /// The `Proxy-Authorization` value for the upstream proxy, if any is
    /// configured.
    pub fn proxy_authorization(&self) -> Option<HeaderValue> {
        if let Some(custom) = self.upstream_custom_auth.as_deref().filter(|custom| !custom.is_empty()) {
            return match HeaderValue::from_str(custom) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(cause = %e, "ignore invalid upstream_custom_auth");
                    None
                }
            };
        }

        let auth = self.upstream_auth.as_deref().filter(|auth| !auth.is_empty())?;
        let credential = format!("Basic {}", STANDARD.encode(auth));
        HeaderValue::from_str(&credential).ok()
    }

    /// The user part of `upstream_auth`, for diagnostics.
    pub fn upstream_username(&self) -> Option<&str> {
        self.upstream_auth.as_deref().and_then(|auth| auth.split(':').next())
    }
}

#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    mode: Option<String>,
    no_proxy: Vec<String>,
    keep_host_header: bool,
    relax_http_form_validation: bool,
    websocket: Option<bool>,
    suppress_connection_errors: bool,
    upstream_auth: Option<String>,
    upstream_custom_auth: Option<String>,
}

impl ProxyConfigBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn mode<S: Into<String>>(mut self, mode: S) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn no_proxy<S: Into<String>>(mut self, entry: S) -> Self {
        self.no_proxy.push(entry.into());
        self
    }

    pub fn keep_host_header(mut self, keep: bool) -> Self {
        self.keep_host_header = keep;
        self
    }

    pub fn relax_http_form_validation(mut self, relax: bool) -> Self {
        self.relax_http_form_validation = relax;
        self
    }

    pub fn websocket(mut self, enabled: bool) -> Self {
        self.websocket = Some(enabled);
        self
    }

    pub fn suppress_connection_errors(mut self, suppress: bool) -> Self {
        self.suppress_connection_errors = suppress;
        self
    }

    pub fn upstream_auth<S: Into<String>>(mut self, auth: S) -> Self {
        self.upstream_auth = Some(auth.into());
        self
    }

    pub fn upstream_custom_auth<S: Into<String>>(mut self, auth: S) -> Self {
        self.upstream_custom_auth = Some(auth.into());
        self
    }

    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        let mode = match self.mode {
            Some(mode) => mode.parse()?,
            None => ModeSpec::Regular,
        };
        let no_proxy = self.no_proxy.iter().map(|entry| entry.parse()).collect::<Result<Vec<_>, _>>()?;

        let config = ProxyConfig {
            mode,
            no_proxy,
            keep_host_header: self.keep_host_header,
            relax_http_form_validation: self.relax_http_form_validation,
            websocket: self.websocket.unwrap_or(true),
            suppress_connection_errors: self.suppress_connection_errors,
            upstream_auth: self.upstream_auth,
            upstream_custom_auth: self.upstream_custom_auth,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Address;
    use http::Method;

    fn request_to(host: &str, port: u16) -> Request {
        Request::absolute(Method::GET, &format!("http://{host}:{port}/")).unwrap()
    }

    #[test]
    fn no_proxy_suffix_and_port_rules() {
        let config = ProxyConfig::builder().no_proxy("example.com").no_proxy("internal:8080").build().unwrap();

        assert!(config.matches_no_proxy(&request_to("api.example.com", 443)));
        assert!(!config.matches_no_proxy(&request_to("internal", 9090)));
        assert!(config.matches_no_proxy(&request_to("internal", 8080)));
        assert!(!config.matches_no_proxy(&request_to("example.org", 80)));
    }

    #[test]
    fn no_proxy_port_mismatch_falls_through_to_later_entries() {
        let config = ProxyConfig::builder().no_proxy("internal:8080").no_proxy("internal").build().unwrap();
        assert!(config.matches_no_proxy(&request_to("internal", 9090)));
    }

    #[test]
    fn rejects_bad_no_proxy_entries() {
        assert!(matches!(
            ProxyConfig::builder().no_proxy("internal:http").build(),
            Err(ConfigError::InvalidNoProxy { .. })
        ));
        assert!(":8080".parse::<NoProxyEntry>().is_err());
    }

    #[test]
    fn basic_proxy_authorization() {
        let config = ProxyConfig::builder().upstream_auth("user:pass").build().unwrap();
        assert_eq!(config.proxy_authorization().unwrap(), "Basic dXNlcjpwYXNz");
        assert_eq!(config.upstream_username(), Some("user"));
    }

    #[test]
    fn custom_proxy_authorization_wins() {
        let config =
            ProxyConfig::builder().upstream_auth("user:pass").upstream_custom_auth("Bearer abc").build().unwrap();
        assert_eq!(config.proxy_authorization().unwrap(), "Bearer abc");
    }

    #[test]
    fn no_credentials_no_header() {
        assert!(ProxyConfig::default().proxy_authorization().is_none());
        assert!(ProxyConfig::builder().upstream_auth("nocolon").build().is_err());
    }

    #[test]
    fn loads_from_json() {
        let config = ProxyConfig::from_json(
            r#"{"mode": "upstream:http://proxy.local:3128", "no_proxy": ["internal:8080"], "websocket": false}"#,
        )
        .unwrap();
        assert_eq!(config.http_mode(), HttpMode::Upstream);
        assert_eq!(config.mode.upstream_server(), Some(&Address::new("proxy.local", 3128)));
        assert_eq!(config.no_proxy[0].to_string(), "internal:8080");
        assert!(!config.websocket);
        assert!(!config.keep_host_header);

        assert!(ProxyConfig::from_json(r#"{"mode": "sideways"}"#).is_err());
    }
}
