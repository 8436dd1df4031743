//! The seams between the HTTP layer and the outside world.
//!
//! # Components
//!
//! - [`ClientConnection`] and [`ServerConnection`]: the transmission contract.
//!   Implementations frame and parse wire bytes, the HTTP layer only sees
//!   [`Request`](crate::protocol::Request) and
//!   [`Response`](crate::protocol::Response) values and body streams.
//! - [`TunnelConnection`]: a server connection living inside a CONNECT tunnel
//!   opened through an upstream proxy.
//! - [`NextLayer`]: the protocol layer that takes over after a tunnel or a
//!   `101 Switching Protocols`.

mod handoff;
mod transmission;
mod tunnel;

pub use handoff::Handoff;
pub use handoff::HandoffKind;
pub use handoff::NextLayer;
pub use transmission::ClientConnection;
pub use transmission::ServerConnection;
pub use tunnel::TunnelConnection;
pub use tunnel::TunnelState;
