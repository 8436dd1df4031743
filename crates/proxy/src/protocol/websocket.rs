//! WebSocket opening handshake detection (RFC 6455, section 4).
//!
//! Only the headers are inspected here; framing belongs to the layer the
//! connection is handed to after a `101 Switching Protocols`.

use http::HeaderMap;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};

pub const SUPPORTED_VERSION: &str = "13";

/// Whether `headers` carry the upgrade headers of either handshake half.
pub fn check_handshake(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));

    let has_key = headers.contains_key(SEC_WEBSOCKET_KEY) || headers.contains_key(SEC_WEBSOCKET_ACCEPT);

    connection_upgrade && upgrade_websocket && has_key
}

pub fn check_client_version(headers: &HeaderMap) -> bool {
    headers.get(SEC_WEBSOCKET_VERSION).is_some_and(|value| value.as_bytes() == SUPPORTED_VERSION.as_bytes())
}
