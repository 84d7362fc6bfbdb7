//! Transport error types.

use lspmux_protocol::RpcError;
use thiserror::Error;

/// Error reading or decoding a single wire frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("read frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid Content-Length header: {0:?}")]
    InvalidHeader(String),
    #[error("decode frame body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error issuing a call or notification over a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote side answered with a JSON-RPC error object.
    #[error("{0}")]
    Rpc(RpcError),
    /// The connection is closed (or closed while the call was in flight).
    #[error("connection closed")]
    Closed,
    #[error("encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// The wire-level error, when the failure came from the remote side.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}
