//! lspmux — Connection Lifecycle and Routing Engine
//!
//! The proxy core: an identity-keyed registry of live backend connections,
//! exactly-once initialization under concurrent first use, call routing
//! with per-connection statistics, a dispatcher for backend-originated
//! requests, and an idle-connection reaper.
//!
//! Blocking work (dialing, handshakes, routed calls, shutdown exchanges)
//! never happens while the registry lock is held; the lock guards only
//! short bookkeeping sections.

pub mod error;
pub mod metrics;
pub mod proxy;
pub mod reaper;
pub mod stats;
pub mod traits;

mod conn;
mod dispatch;

pub use error::{ErrorList, ProxyError};
pub use metrics::{HistogramSnapshot, MetricsSnapshot, ProxyMetrics};
pub use proxy::{Proxy, ProxyConfig};
pub use reaper::Reaper;
pub use stats::{ConnStats, StatsSnapshot};
pub use traits::{
    ClientSessions, FsProvider, FsProviderDyn, SessionHandle, TelemetrySink, WorkspaceFs,
    WorkspaceFsDyn,
};
