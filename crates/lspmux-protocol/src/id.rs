//! Connection identities.
//!
//! A backend is identified by the minimal state necessary to reinitialize
//! it. At most one live backend connection exists per [`ServerId`]; requests
//! that route to equal ids share the same connection.

use serde::{Deserialize, Serialize};

/// The workspace/session context a backend serves: a root URI (repository
/// checkout, usually including a revision) and a mode (language / backend
/// flavor). The mode doubles as the label on per-connection metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    #[serde(rename = "rootUri")]
    pub root_uri: String,
    pub mode: String,
}

impl ContextKey {
    pub fn new(root_uri: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            root_uri: root_uri.into(),
            mode: mode.into(),
        }
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.mode, self.root_uri)
    }
}

/// Identity of one backend connection: a workspace context plus an optional
/// path-prefix qualifier (set when the backend should run in a
/// subdirectory of the workspace, otherwise empty).
///
/// Two ids that differ only in `path_prefix` map to distinct connections
/// even though they share a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    pub context: ContextKey,
    #[serde(rename = "pathPrefix", default)]
    pub path_prefix: String,
}

impl ServerId {
    pub fn new(context: ContextKey, path_prefix: impl Into<String>) -> Self {
        Self {
            context,
            path_prefix: path_prefix.into(),
        }
    }

    pub fn mode(&self) -> &str {
        &self.context.mode
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path_prefix.is_empty() {
            write!(f, "server({})", self.context)
        } else {
            write!(f, "server({} prefix={:?})", self.context, self.path_prefix)
        }
    }
}
