//! Typed parameter and result payloads for the methods the proxy interprets.

use serde::{Deserialize, Serialize};

/// Parameters of the one-time `initialize` handshake the proxy performs on
/// each fresh backend connection.
///
/// The backend sees its workspace as a virtual filesystem rooted at
/// `file:///` and served back to it over the `fs/*` methods; the original
/// workspace URI and mode ride along so the backend can report them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "rootPath")]
    pub root_path: String,
    #[serde(rename = "originalRootUri")]
    pub original_root_uri: String,
    pub mode: String,
}

impl InitializeParams {
    pub fn new(original_root_uri: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            root_path: "file:///".into(),
            original_root_uri: original_root_uri.into(),
            mode: mode.into(),
        }
    }
}

/// Metadata for one filesystem entry, returned by `fs/stat`, `fs/lstat`
/// and (per entry) `fs/readDir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub dir: bool,
}
