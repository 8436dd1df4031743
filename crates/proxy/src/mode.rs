//! Proxy operating modes and the request-form rules each of them enforces.

use std::fmt;
use std::str::FromStr;

use http::Uri;
use serde::{Deserialize, Deserializer};

use crate::config::ConfigError;
use crate::ensure;
use crate::protocol::{Address, ProxyError, Request, RequestForm, default_port};

/// How the HTTP layer sees the traffic it is given.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HttpMode {
    /// Explicit forward proxy: clients send CONNECT or absolute-form requests.
    Regular,
    /// Traffic was redirected at the network level; the destination comes
    /// from the original connection address, not from the request.
    Transparent,
    /// Forward proxy that chains every request through another proxy.
    Upstream,
}

impl HttpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMode::Regular => "regular",
            HttpMode::Transparent => "transparent",
            HttpMode::Upstream => "upstream",
        }
    }

    pub fn allowed_forms(&self) -> &'static [RequestForm] {
        match self {
            HttpMode::Regular | HttpMode::Upstream => &[RequestForm::Authority, RequestForm::Absolute],
            HttpMode::Transparent => &[RequestForm::Relative],
        }
    }
}

impl fmt::Display for HttpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks that `request` uses an addressing form `mode` can serve.
pub fn validate_request_form(mode: HttpMode, request: &Request) -> Result<(), ProxyError> {
    let form = request.first_line_form();
    ensure!(
        form != RequestForm::Absolute || request.scheme == "http" || request.scheme == "https",
        ProxyError::form(format!("Invalid request scheme: {}", request.scheme))
    );

    let allowed = mode.allowed_forms();
    if allowed.contains(&form) {
        return Ok(());
    }

    // HTTP/2 carries the authority in a pseudo-header even for redirected traffic.
    if request.is_http2() && mode == HttpMode::Transparent && form == RequestForm::Absolute {
        return Ok(());
    }

    if mode == HttpMode::Transparent {
        let got = if form == RequestForm::Authority { "HTTP CONNECT" } else { "absolute-form" };
        return Err(ProxyError::form(format!(
            "received an {got} request even though the proxy is not running in regular mode; \
             this usually indicates a misconfiguration of the proxy mode"
        )));
    }

    let expected = allowed.iter().map(RequestForm::as_str).collect::<Vec<_>>().join(" or ");
    Err(ProxyError::form(format!("Invalid HTTP request form (expected: {expected}, got: {form})")))
}

/// The configured mode descriptor, e.g. `upstream:http://proxy.local:3128`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ModeSpec {
    #[default]
    Regular,
    Transparent,
    Socks5,
    Upstream(Address),
    Reverse { scheme: String, address: Address },
}

impl ModeSpec {
    pub fn http_mode(&self) -> HttpMode {
        match self {
            ModeSpec::Regular => HttpMode::Regular,
            ModeSpec::Upstream(_) => HttpMode::Upstream,
            ModeSpec::Transparent | ModeSpec::Socks5 | ModeSpec::Reverse { .. } => HttpMode::Transparent,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ModeSpec::Socks5)
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self, ModeSpec::Reverse { .. })
    }

    /// The proxy or origin every request is sent to, if the mode fixes one.
    pub fn upstream_server(&self) -> Option<&Address> {
        match self {
            ModeSpec::Upstream(address) | ModeSpec::Reverse { address, .. } => Some(address),
            ModeSpec::Regular | ModeSpec::Transparent | ModeSpec::Socks5 => None,
        }
    }
}

impl fmt::Display for ModeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeSpec::Regular => f.write_str("regular"),
            ModeSpec::Transparent => f.write_str("transparent"),
            ModeSpec::Socks5 => f.write_str("socks5"),
            ModeSpec::Upstream(address) => write!(f, "upstream:http://{address}"),
            ModeSpec::Reverse { scheme, address } => write!(f, "reverse:{scheme}://{address}"),
        }
    }
}

fn parse_server_spec(spec: &str) -> Result<(String, Address), ConfigError> {
    let spec = if spec.contains("://") { spec.to_string() } else { format!("http://{spec}") };
    let uri = spec.parse::<Uri>().map_err(|e| ConfigError::invalid_mode(format!("{spec}: {e}")))?;
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
    ensure!(scheme == "http" || scheme == "https", ConfigError::invalid_mode(format!("unsupported scheme in {spec}")));
    let host = uri.host().ok_or_else(|| ConfigError::invalid_mode(format!("missing host in {spec}")))?;
    let port = uri.port_u16().unwrap_or_else(|| default_port(&scheme));
    Ok((scheme, Address::new(host.trim_start_matches('[').trim_end_matches(']'), port)))
}

impl FromStr for ModeSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => return Ok(ModeSpec::Regular),
            "transparent" => return Ok(ModeSpec::Transparent),
            "socks5" => return Ok(ModeSpec::Socks5),
            _ => {}
        }

        if let Some(spec) = s.strip_prefix("upstream:") {
            let (_scheme, address) = parse_server_spec(spec)?;
            return Ok(ModeSpec::Upstream(address));
        }

        if let Some(spec) = s.strip_prefix("reverse:") {
            let (scheme, address) = parse_server_spec(spec)?;
            return Ok(ModeSpec::Reverse { scheme, address });
        }

        Err(ConfigError::invalid_mode(s))
    }
}

impl<'de> Deserialize<'de> for ModeSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
