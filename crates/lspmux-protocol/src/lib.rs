//! lspmux — Protocol Types
//!
//! JSON-RPC 2.0 compatible types for the backend-proxy wire protocol.
//! This crate is the single source of truth for all protocol types,
//! method names, connection identities, and error codes.

pub mod error;
pub mod id;
pub mod jsonrpc;
pub mod methods;
pub mod params;

pub use error::{RpcError, RpcErrorCode};
pub use id::{ContextKey, ServerId};
pub use jsonrpc::{
    HandlerResult, RequestId, RpcErrorResponse, RpcNotification, RpcRequest, RpcResponse,
    RpcSuccessResponse,
};
pub use methods::Methods;
pub use params::{FileInfo, InitializeParams};
