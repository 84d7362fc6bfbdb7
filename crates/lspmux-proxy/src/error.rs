//! Proxy error taxonomy.
//!
//! Failures local to one connection never cross-contaminate others;
//! aggregate operations collect per-item errors into an [`ErrorList`]
//! instead of aborting on the first failure.

use std::sync::Arc;
use std::time::Duration;

use lspmux_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Establishing the raw transport failed. Transient by nature; the
    /// connection is discarded so a later call dials fresh.
    #[error("dial backend for {id}: {source}")]
    Dial {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// Opening the workspace filesystem during initialization failed.
    #[error("open workspace filesystem for {id}: {source}")]
    OpenFs {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// The `initialize` handshake failed.
    #[error("initialize backend for {id}: {source}")]
    Initialize {
        id: String,
        #[source]
        source: TransportError,
    },

    /// The `initialize` handshake outran the internal bound.
    #[error("initialize backend for {id}: timed out after {timeout:?}")]
    InitTimeout { id: String, timeout: Duration },

    /// Returned by the caller that executed a failed one-time init.
    #[error("{0}")]
    InitFailed(Arc<ProxyError>),

    /// Returned by callers that merely observed a failed one-time init run
    /// by a concurrent caller — wrapped so logs do not suggest the dial
    /// and handshake were attempted more than once.
    #[error("another caller failed to connect and initialize the backend: {0}")]
    SharedInit(Arc<ProxyError>),

    /// A routed call failed. Recorded in per-method error statistics; the
    /// connection itself stays up.
    #[error("call {method}: {source}")]
    Call {
        method: String,
        #[source]
        source: TransportError,
    },

    /// The caller-supplied deadline elapsed first.
    #[error("call {method}: deadline of {deadline:?} exceeded")]
    DeadlineExceeded { method: String, deadline: Duration },

    /// The graceful shutdown exchange outran its deadline. Resource
    /// cleanup still proceeded.
    #[error("shutdown exchange timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("close workspace filesystem: {0}")]
    CloseFs(#[source] std::io::Error),

    #[error("shutdown task failed: {0}")]
    Join(#[source] tokio::task::JoinError),

    #[error("{0}")]
    Aggregate(ErrorList),
}

/// Collects non-fatal errors from a multi-step or multi-connection
/// operation into a single report.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<ProxyError>);

impl ErrorList {
    pub fn push(&mut self, err: ProxyError) {
        self.0.push(err);
    }

    pub fn merge(&mut self, other: ErrorList) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[ProxyError] {
        &self.0
    }

    /// `Ok` when nothing was collected, otherwise the combined report.
    pub fn into_result(mut self) -> Result<(), ProxyError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(ProxyError::Aggregate(self)),
        }
    }
}

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors occurred: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
