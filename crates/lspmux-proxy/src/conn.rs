//! One live backend connection and its graceful teardown.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use lspmux_protocol::{Methods, ServerId};
use lspmux_transport::RpcPeer;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::{ErrorList, ProxyError};
use crate::stats::{ConnStats, StatsSnapshot};
use crate::traits::WorkspaceFsDyn;

/// One proxied backend connection.
///
/// Registered in the proxy *before* initialization runs so concurrent
/// lookups converge on the same instance. `init` fires exactly once; its
/// outcome is shared by every waiter. Once removed from the registry a
/// connection is never reused.
pub(crate) struct ServerConn {
    pub(crate) id: ServerId,
    /// One-shot guard around dial + workspace-fs open + handshake.
    pub(crate) init: OnceCell<Result<(), Arc<ProxyError>>>,
    /// The live session, present only after initialization succeeded.
    pub(crate) transport: OnceLock<Arc<RpcPeer>>,
    /// The workspace filesystem, opened during initialization. Shared with
    /// the dispatcher, which serves fs/* requests from it.
    pub(crate) fs: Arc<OnceLock<Arc<dyn WorkspaceFsDyn>>>,
    /// Connection-local statistics, independent of the registry lock.
    pub(crate) stats: Arc<Mutex<ConnStats>>,
}

impl ServerConn {
    pub(crate) fn new(id: ServerId) -> Self {
        Self {
            id,
            init: OnceCell::new(),
            transport: OnceLock::new(),
            fs: Arc::new(OnceLock::new()),
            stats: Arc::new(Mutex::new(ConnStats::new())),
        }
    }

    pub(crate) fn touch(&self) {
        self.stats.lock().touch();
    }

    pub(crate) fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.lock().snapshot()
    }

    /// Gracefully retire the connection: a `shutdown` request followed —
    /// regardless of its outcome — by an `exit` notification, the whole
    /// exchange bounded by `deadline`. The workspace filesystem and the
    /// transport are always closed, even when the exchange failed or timed
    /// out. The caller must already have removed this connection from the
    /// registry.
    pub(crate) async fn shutdown_and_exit(&self, deadline: Duration) -> Result<(), ProxyError> {
        let mut errs = ErrorList::default();

        if let Some(peer) = self.transport.get() {
            let exchange = async {
                let mut errs = ErrorList::default();
                if let Err(e) = peer.call(Methods::SHUTDOWN, None).await {
                    errs.push(ProxyError::Call {
                        method: Methods::SHUTDOWN.to_string(),
                        source: e,
                    });
                }
                // Even if "shutdown" failed, still tell the backend to
                // really exit.
                if let Err(e) = peer.notify(Methods::EXIT, None).await {
                    errs.push(ProxyError::Call {
                        method: Methods::EXIT.to_string(),
                        source: e,
                    });
                }
                errs
            };

            // Bound the exchange so an unresponsive backend cannot hold up
            // the sweep.
            match tokio::time::timeout(deadline, exchange).await {
                Ok(inner) => errs.merge(inner),
                Err(_) => errs.push(ProxyError::ShutdownTimeout(deadline)),
            }
        }

        // Release resources regardless of how the exchange went.
        if let Some(fs) = self.fs.get() {
            if let Err(e) = fs.close_dyn().await {
                errs.push(ProxyError::CloseFs(e));
            }
        }
        if let Some(peer) = self.transport.get() {
            peer.close();
        }

        errs.into_result()
    }
}
