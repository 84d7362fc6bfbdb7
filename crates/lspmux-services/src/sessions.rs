//! Directory of active client sessions, keyed by workspace context.
//!
//! Client-facing plumbing registers a session when a client attaches to a
//! workspace and unregisters it when the client goes away; the proxy's
//! dispatcher asks for the current set when fanning out backend
//! notifications.

use dashmap::DashMap;
use lspmux_protocol::{ContextKey, RpcNotification};
use lspmux_proxy::{ClientSessions, SessionHandle};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ContextKey, Vec<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `context`. Returns the generated session id
    /// and the receiver its notifications arrive on.
    pub fn register(
        &self,
        context: &ContextKey,
    ) -> (String, mpsc::UnboundedReceiver<RpcNotification>) {
        let id = Uuid::new_v4().to_string();
        let (handle, rx) = SessionHandle::new(id.clone());
        self.sessions.entry(context.clone()).or_default().push(handle);
        debug!("session {id} attached to {context}");
        (id, rx)
    }

    /// Remove one session. No-op if it is already gone.
    pub fn unregister(&self, context: &ContextKey, session_id: &str) {
        if let Some(mut handles) = self.sessions.get_mut(context) {
            handles.retain(|h| h.id() != session_id);
            if handles.is_empty() {
                drop(handles);
                self.sessions.remove_if(context, |_, v| v.is_empty());
            }
        }
    }

    /// Total sessions across all contexts.
    pub fn len(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClientSessions for SessionRegistry {
    fn active_sessions(&self, context: &ContextKey) -> Vec<SessionHandle> {
        self.sessions
            .get(context)
            .map(|handles| handles.clone())
            .unwrap_or_default()
    }
}
