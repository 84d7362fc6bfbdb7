//! Capability seams consumed by the proxy core.
//!
//! Each async trait comes with an object-safe `*Dyn` wrapper so the proxy
//! can hold them behind `Arc<dyn ...>` without boxing at every call site
//! in user code.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use lspmux_protocol::{ContextKey, FileInfo, RpcNotification, ServerId};
use serde_json::Value;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────────────
// Workspace filesystem
// ─────────────────────────────────────────────────────────────────────────────

/// A scoped, read-only view of one workspace's file contents. Opened during
/// connection initialization, closed during teardown. Paths are
/// workspace-relative.
pub trait WorkspaceFs: Send + Sync + 'static {
    fn read_file(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = io::Result<Vec<u8>>> + Send;

    fn read_dir(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = io::Result<Vec<FileInfo>>> + Send;

    fn stat(&self, path: &str) -> impl std::future::Future<Output = io::Result<FileInfo>> + Send;

    fn lstat(&self, path: &str) -> impl std::future::Future<Output = io::Result<FileInfo>> + Send;

    /// Release any resources backing the view. Reads after close fail.
    fn close(&self) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

/// Object-safe wrapper for [`WorkspaceFs`].
pub trait WorkspaceFsDyn: Send + Sync {
    fn read_file_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<Vec<u8>>> + Send + 'a>>;
    fn read_dir_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<Vec<FileInfo>>> + Send + 'a>>;
    fn stat_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<FileInfo>> + Send + 'a>>;
    fn lstat_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<FileInfo>> + Send + 'a>>;
    fn close_dyn(&self)
    -> Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send + '_>>;
}

impl<T: WorkspaceFs> WorkspaceFsDyn for T {
    fn read_file_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(self.read_file(path))
    }
    fn read_dir_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<Vec<FileInfo>>> + Send + 'a>> {
        Box::pin(self.read_dir(path))
    }
    fn stat_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<FileInfo>> + Send + 'a>> {
        Box::pin(self.stat(path))
    }
    fn lstat_dyn<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<FileInfo>> + Send + 'a>> {
        Box::pin(self.lstat(path))
    }
    fn close_dyn(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send + '_>> {
        Box::pin(self.close())
    }
}

/// Opens the workspace filesystem for a connection identity.
pub trait FsProvider: Send + Sync + 'static {
    fn open(
        &self,
        id: &ServerId,
    ) -> impl std::future::Future<Output = io::Result<Arc<dyn WorkspaceFsDyn>>> + Send;
}

/// Object-safe wrapper for [`FsProvider`].
pub trait FsProviderDyn: Send + Sync {
    fn open_dyn<'a>(
        &'a self,
        id: &'a ServerId,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<Arc<dyn WorkspaceFsDyn>>> + Send + 'a>>;
}

impl<T: FsProvider> FsProviderDyn for T {
    fn open_dyn<'a>(
        &'a self,
        id: &'a ServerId,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<Arc<dyn WorkspaceFsDyn>>> + Send + 'a>>
    {
        Box::pin(self.open(id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client sessions
// ─────────────────────────────────────────────────────────────────────────────

/// A deliverable target for backend-push notifications: one client session
/// interested in a workspace. Delivery is a non-blocking send; a failed
/// send means the session is gone and is simply skipped.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::UnboundedSender<RpcNotification>,
}

impl SessionHandle {
    /// Create a handle and the receiver its notifications arrive on.
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<RpcNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fire-and-forget delivery. Returns false if the session is gone.
    pub fn deliver(&self, note: RpcNotification) -> bool {
        self.tx.send(note).is_ok()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Directory of active client sessions, keyed by workspace context.
pub trait ClientSessions: Send + Sync + 'static {
    /// Every session currently interested in `context`.
    fn active_sessions(&self, context: &ContextKey) -> Vec<SessionHandle>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Record-event capability for backend telemetry. Implementations must not
/// block.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, event: Value);
}
