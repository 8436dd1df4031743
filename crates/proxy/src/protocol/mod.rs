//! Core value objects of the proxy.
//!
//! - **Messages** ([`message`]): [`Request`], [`Response`] and the body
//!   plumbing ([`BodyStream`], [`BodyMode`]) they share.
//! - **Flow** ([`flow`]): one exchange as handed to hooks.
//! - **Synthesized responses** ([`responses`]): error pages, CONNECT and
//!   `100 Continue` answers.
//! - **WebSocket handshake** ([`websocket`]): header checks deciding whether a
//!   `101` hands off to the WebSocket layer.
//! - **Errors** ([`error`]): [`ProxyError`] and the [`FlowError`] record.

mod error;
pub use error::FlowError;
pub use error::ProxyError;

mod message;
pub use message::Address;
pub use message::BodyMode;
pub use message::BodyStream;
pub use message::BodyTransform;
pub use message::Request;
pub use message::RequestForm;
pub use message::Response;
pub use message::collect_body;
pub use message::once_body;
pub(crate) use message::default_port;

mod flow;
pub use flow::ConnectionInfo;
pub use flow::Flow;
pub use flow::WEBSOCKET_METADATA_KEY;

pub mod responses;
pub mod websocket;
