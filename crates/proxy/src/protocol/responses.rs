//! Responses the proxy synthesizes itself instead of reading them upstream.

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode, Version};

use crate::protocol::Response;

/// Builds a small, self-contained HTML error page.
///
/// `headers` replace defaults of the same name.
pub fn make_error_response(status: StatusCode, message: &str, headers: Option<HeaderMap>) -> Response {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = format!(
        "<html>\n<head>\n    <title>{code} {reason}</title>\n</head>\n<body>\n    <h1>{code} {reason}</h1>\n    <p>{message}</p>\n</body>\n</html>\n",
        code = status.as_u16(),
        reason = reason,
        message = escape_html(message),
    );

    let mut response = Response::new(status)
        .with_header(CONTENT_TYPE, HeaderValue::from_static(mime::TEXT_HTML.as_ref()))
        .with_header(CONNECTION, HeaderValue::from_static("close"))
        .with_header(CONTENT_LENGTH, HeaderValue::from(body.len()));
    if let Some(extra) = headers {
        response.headers.extend(extra);
    }
    response.with_content(Bytes::from(body))
}

/// The answer to a CONNECT the proxy terminates itself.
pub fn make_connect_response(version: Version) -> Response {
    Response::new(StatusCode::OK)
        .with_reason("Connection established")
        .with_version(version)
        .with_content(Bytes::new())
}

/// The interim answer to `Expect: 100-continue`.
pub fn make_expect_continue_response() -> Response {
    Response::new(StatusCode::CONTINUE).with_content(Bytes::new())
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
