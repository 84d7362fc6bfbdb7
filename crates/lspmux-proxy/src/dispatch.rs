//! Per-connection dispatcher for backend-originated traffic.
//!
//! The proxy interprets only a small fixed surface: telemetry hand-off,
//! workspace filesystem reads, and diagnostics fan-out. Everything else is
//! answered with a method-not-found error — richer methods belong to the
//! backend and are reached through call routing, not here.

use std::io;
use std::sync::{Arc, OnceLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lspmux_protocol::methods::is_fs_method;
use lspmux_protocol::{HandlerResult, Methods, RpcError, RpcNotification, ServerId};
use lspmux_transport::InboundHandler;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::stats::ConnStats;
use crate::traits::{ClientSessions, TelemetrySink, WorkspaceFsDyn};

pub(crate) struct Dispatcher {
    id: ServerId,
    stats: Arc<Mutex<ConnStats>>,
    fs: Arc<OnceLock<Arc<dyn WorkspaceFsDyn>>>,
    sessions: Arc<dyn ClientSessions>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Dispatcher {
    pub(crate) fn new(
        id: ServerId,
        stats: Arc<Mutex<ConnStats>>,
        fs: Arc<OnceLock<Arc<dyn WorkspaceFsDyn>>>,
        sessions: Arc<dyn ClientSessions>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            id,
            stats,
            fs,
            sessions,
            telemetry,
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            Methods::TELEMETRY_EVENT => {
                let event = params
                    .ok_or_else(|| RpcError::invalid_params("telemetry event requires params"))?;
                self.telemetry.record(event);
                Ok(Value::Null)
            }

            m if is_fs_method(m) => {
                let path: String = match params {
                    Some(p) => serde_json::from_value(p).map_err(|e| {
                        RpcError::invalid_params(format!("expected a string path: {e}"))
                    })?,
                    None => return Err(RpcError::invalid_params("path parameter required")),
                };
                self.handle_fs(m, &path).await
            }

            Methods::PUBLISH_DIAGNOSTICS => {
                // Forward to every client session sharing this connection's
                // workspace context. A dead recipient is skipped; it never
                // fails the dispatch or the other recipients.
                let note = RpcNotification::new(method, params);
                for session in self.sessions.active_sessions(&self.id.context) {
                    if !session.deliver(note.clone()) {
                        debug!("dropping diagnostics for stale session {}", session.id());
                    }
                }
                Ok(Value::Null)
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }

    async fn handle_fs(&self, method: &str, path: &str) -> HandlerResult {
        let Some(fs) = self.fs.get() else {
            return Err(RpcError::internal("workspace filesystem not ready"));
        };

        let outcome: io::Result<Value> = match method {
            Methods::FS_READ_FILE => fs
                .read_file_dyn(path)
                .await
                .map(|bytes| Value::String(BASE64.encode(bytes))),
            Methods::FS_READ_DIR => match fs.read_dir_dyn(path).await {
                Ok(entries) => return to_value(entries),
                Err(e) => Err(e),
            },
            Methods::FS_READ_DIR_FILES => self.read_dir_files(fs.as_ref(), path).await,
            Methods::FS_STAT => match fs.stat_dyn(path).await {
                Ok(info) => return to_value(info),
                Err(e) => Err(e),
            },
            Methods::FS_LSTAT => match fs.lstat_dyn(path).await {
                Ok(info) => return to_value(info),
                Err(e) => Err(e),
            },
            _ => return Err(RpcError::method_not_found(method)),
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RpcError::file_not_found(path)),
            Err(e) => Err(RpcError::server_error(format!("{method} {path}: {e}"))),
        }
    }

    /// Contents of every regular file directly under `path`, keyed by
    /// entry name.
    async fn read_dir_files(&self, fs: &dyn WorkspaceFsDyn, path: &str) -> io::Result<Value> {
        let entries = fs.read_dir_dyn(path).await?;
        let mut files = serde_json::Map::new();
        for entry in entries.into_iter().filter(|e| !e.dir) {
            let child = if path.is_empty() || path == "/" {
                entry.name.clone()
            } else {
                format!("{}/{}", path.trim_end_matches('/'), entry.name)
            };
            let bytes = fs.read_file_dyn(&child).await?;
            files.insert(entry.name, Value::String(BASE64.encode(bytes)));
        }
        Ok(Value::Object(files))
    }
}

impl InboundHandler for Dispatcher {
    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        // Activity on entry and on exit: receiving the request and
        // completing the response both count against idle eviction.
        self.stats.lock().touch();
        let result = self.dispatch(method, params).await;
        self.stats.lock().touch();
        result
    }
}

fn to_value<T: serde::Serialize>(value: T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| RpcError::internal(format!("encode result: {e}")))
}
