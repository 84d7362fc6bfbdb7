//! Method name constants — the fixed surface the proxy itself interprets.
//!
//! Every other method name is opaque to the proxy and forwarded verbatim to
//! the backend that owns the target workspace.

/// Method names the proxy sends to or interprets from a backend.
pub struct Methods;

impl Methods {
    // ── Session lifecycle ───────────────────────────────────────────────
    pub const INITIALIZE: &str = "initialize";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";

    // ── Backend-originated requests served by the proxy ─────────────────
    pub const TELEMETRY_EVENT: &str = "telemetry/event";
    pub const FS_READ_FILE: &str = "fs/readFile";
    pub const FS_READ_DIR_FILES: &str = "fs/readDirFiles";
    pub const FS_READ_DIR: &str = "fs/readDir";
    pub const FS_STAT: &str = "fs/stat";
    pub const FS_LSTAT: &str = "fs/lstat";

    // ── Backend-originated notifications fanned out to clients ──────────
    pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
}

/// Whether `method` is one of the workspace-filesystem read methods the
/// proxy serves directly (all take a single JSON string path parameter).
pub fn is_fs_method(method: &str) -> bool {
    matches!(
        method,
        Methods::FS_READ_FILE
            | Methods::FS_READ_DIR_FILES
            | Methods::FS_READ_DIR
            | Methods::FS_STAT
            | Methods::FS_LSTAT
    )
}
