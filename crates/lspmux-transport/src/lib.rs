//! lspmux — Transport Layer
//!
//! A JSON-RPC 2.0 peer speaking Content-Length framed messages over any
//! duplex byte stream. The transport layer handles:
//! - frame encoding/decoding
//! - outbound calls with pending-response tracking
//! - inbound requests/notifications routed to an `InboundHandler`
//! - disconnect detection
//!
//! Connection establishment is abstracted behind the `Dialer` trait; a TCP
//! implementation is provided.

pub mod dial;
pub mod error;
pub mod frame;
pub mod peer;

pub use dial::{BoxedStream, Dialer, DialerDyn, TcpDialer};
pub use error::{FrameError, TransportError};
pub use peer::{InboundHandler, RpcPeer};
