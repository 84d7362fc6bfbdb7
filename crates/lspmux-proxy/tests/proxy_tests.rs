//! Proxy lifecycle tests — connection sharing, exactly-once initialization,
//! idle eviction, dispatcher behavior, and broadcast fan-out, all over
//! in-memory transports with scripted fake backends.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lspmux_protocol::{
    ContextKey, FileInfo, RequestId, RpcError, RpcNotification, RpcResponse, ServerId,
};
use lspmux_proxy::{
    ClientSessions, FsProvider, Proxy, ProxyConfig, ProxyError, Reaper, SessionHandle,
    TelemetrySink, WorkspaceFs, WorkspaceFsDyn,
};
use lspmux_transport::frame::{encode_frame, read_frame};
use lspmux_transport::{BoxedStream, Dialer};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CALL_DEADLINE: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────
// Scripted fake backend
// ─────────────────────────────────────────────────────────────────────────

/// What the fake backend should do once a connection reaches it.
#[derive(Clone, Default)]
struct BackendScript {
    /// Answer `initialize` with an error.
    fail_init: bool,
    /// Never answer `initialize`.
    hang_init: bool,
    /// Delay before answering `initialize`.
    init_delay: Option<Duration>,
    /// Delay before answering `echo`.
    echo_delay: Option<Duration>,
    /// Requests the backend issues to the proxy right after a successful
    /// handshake (ids assigned from 900 upward, in order).
    probes: Vec<(String, Value)>,
    /// `textDocument/publishDiagnostics` params to push after the handshake.
    diagnostics: Option<Value>,
    /// `telemetry/event` params to push after the handshake.
    telemetry: Option<Value>,
    /// Drop the connection this long after a successful handshake.
    close_after_init: Option<Duration>,
}

/// Everything the fake backend observed, shared across reconnects.
#[derive(Default)]
struct BackendLog {
    initializes: AtomicUsize,
    shutdowns: AtomicUsize,
    exits: AtomicUsize,
    /// Raw response messages to the backend's own probe requests.
    probe_responses: Mutex<Vec<Value>>,
}

async fn write_msg(write: &mut WriteHalf<DuplexStream>, msg: &Value) {
    let _ = write.write_all(&encode_frame(msg).unwrap()).await;
}

async fn run_backend(stream: DuplexStream, script: BackendScript, log: Arc<BackendLog>) {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);
    let mut next_probe_id = 900i64;
    // Deadline after which the backend hangs up on its own.
    let mut close_at: Option<tokio::time::Instant> = None;

    loop {
        let frame = match close_at {
            Some(at) => match tokio::time::timeout_at(at, read_frame(&mut reader)).await {
                Ok(frame) => frame,
                Err(_) => break,
            },
            None => read_frame(&mut reader).await,
        };
        let msg = match frame {
            Ok(Some(msg)) => msg,
            _ => break,
        };
        let method = msg.get("method").and_then(|m| m.as_str()).map(str::to_string);
        let id = msg.get("id").cloned();

        match (method.as_deref(), id) {
            (Some("initialize"), Some(id)) => {
                log.initializes.fetch_add(1, Ordering::SeqCst);
                if script.hang_init {
                    continue;
                }
                if let Some(delay) = script.init_delay {
                    tokio::time::sleep(delay).await;
                }
                let id: RequestId = serde_json::from_value(id).unwrap();
                if script.fail_init {
                    let resp =
                        RpcResponse::error(Some(id), RpcError::server_error("mode not supported"));
                    write_msg(&mut write, &serde_json::to_value(&resp).unwrap()).await;
                    continue;
                }
                let resp = RpcResponse::success(id, json!({"capabilities": {}}));
                write_msg(&mut write, &serde_json::to_value(&resp).unwrap()).await;

                for (method, params) in &script.probes {
                    let req = json!({
                        "jsonrpc": "2.0",
                        "id": next_probe_id,
                        "method": method,
                        "params": params,
                    });
                    next_probe_id += 1;
                    write_msg(&mut write, &req).await;
                }
                if let Some(params) = &script.diagnostics {
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "textDocument/publishDiagnostics",
                        "params": params,
                    });
                    write_msg(&mut write, &note).await;
                }
                if let Some(params) = &script.telemetry {
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "telemetry/event",
                        "params": params,
                    });
                    write_msg(&mut write, &note).await;
                }
                if let Some(delay) = script.close_after_init {
                    close_at = Some(tokio::time::Instant::now() + delay);
                }
            }

            (Some("shutdown"), Some(id)) => {
                log.shutdowns.fetch_add(1, Ordering::SeqCst);
                let id: RequestId = serde_json::from_value(id).unwrap();
                let resp = RpcResponse::success(id, Value::Null);
                write_msg(&mut write, &serde_json::to_value(&resp).unwrap()).await;
            }

            (Some("exit"), None) => {
                log.exits.fetch_add(1, Ordering::SeqCst);
                break;
            }

            (Some("echo"), Some(id)) => {
                if let Some(delay) = script.echo_delay {
                    tokio::time::sleep(delay).await;
                }
                let id: RequestId = serde_json::from_value(id).unwrap();
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let resp = RpcResponse::success(id, params);
                write_msg(&mut write, &serde_json::to_value(&resp).unwrap()).await;
            }

            (Some("boom"), Some(id)) => {
                let id: RequestId = serde_json::from_value(id).unwrap();
                let resp = RpcResponse::error(Some(id), RpcError::server_error("kaboom"));
                write_msg(&mut write, &serde_json::to_value(&resp).unwrap()).await;
            }

            (Some(other), Some(id)) => {
                let id: RequestId = serde_json::from_value(id).unwrap();
                let resp = RpcResponse::error(Some(id), RpcError::method_not_found(other));
                write_msg(&mut write, &serde_json::to_value(&resp).unwrap()).await;
            }

            // Response to one of our probe requests
            (None, Some(_)) => {
                log.probe_responses.lock().push(msg);
            }

            _ => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// In-memory dialer
// ─────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct BackendControl {
    script: Arc<Mutex<BackendScript>>,
    fail_dial: Arc<AtomicBool>,
    dials: Arc<AtomicUsize>,
    log: Arc<BackendLog>,
}

struct MemDialer {
    control: BackendControl,
}

impl Dialer for MemDialer {
    async fn dial(&self, _id: &ServerId) -> io::Result<BoxedStream> {
        if self.control.fail_dial.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "backend unavailable",
            ));
        }
        self.control.dials.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let script = self.control.script.lock().clone();
        tokio::spawn(run_backend(remote, script, self.control.log.clone()));
        Ok(Box::new(local))
    }
}

fn mem_dialer(script: BackendScript) -> (MemDialer, BackendControl) {
    let control = BackendControl {
        script: Arc::new(Mutex::new(script)),
        fail_dial: Arc::new(AtomicBool::new(false)),
        dials: Arc::new(AtomicUsize::new(0)),
        log: Arc::new(BackendLog::default()),
    };
    (
        MemDialer {
            control: control.clone(),
        },
        control,
    )
}

// ─────────────────────────────────────────────────────────────────────────
// In-memory workspace filesystem
// ─────────────────────────────────────────────────────────────────────────

struct StubFs {
    files: HashMap<String, Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl StubFs {
    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::other("filesystem closed"));
        }
        Ok(())
    }

    fn entries_under(&self, path: &str) -> Vec<FileInfo> {
        let prefix = if path.is_empty() || path == "/" {
            String::new()
        } else {
            format!("{}/", path.trim_matches('/'))
        };
        let mut seen = HashMap::new();
        for (name, contents) in &self.files {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    seen.entry(dir.to_string()).or_insert(FileInfo {
                        name: dir.to_string(),
                        size: 0,
                        dir: true,
                    });
                }
                None => {
                    seen.insert(
                        rest.to_string(),
                        FileInfo {
                            name: rest.to_string(),
                            size: contents.len() as u64,
                            dir: false,
                        },
                    );
                }
            }
        }
        let mut entries: Vec<_> = seen.into_values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

impl WorkspaceFs for StubFs {
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        self.check_open()?;
        self.files
            .get(path.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<FileInfo>> {
        self.check_open()?;
        let entries = self.entries_under(path);
        if entries.is_empty() && !(path.is_empty() || path == "/") {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()));
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> io::Result<FileInfo> {
        self.check_open()?;
        let key = path.trim_matches('/');
        if let Some(contents) = self.files.get(key) {
            return Ok(FileInfo {
                name: key.rsplit('/').next().unwrap_or(key).to_string(),
                size: contents.len() as u64,
                dir: false,
            });
        }
        if !self.entries_under(key).is_empty() {
            return Ok(FileInfo {
                name: key.rsplit('/').next().unwrap_or(key).to_string(),
                size: 0,
                dir: true,
            });
        }
        Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    async fn lstat(&self, path: &str) -> io::Result<FileInfo> {
        self.stat(path).await
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
struct StubFsProvider {
    files: HashMap<String, Vec<u8>>,
    /// Closed flag of the most recently opened filesystem.
    last_closed: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl FsProvider for StubFsProvider {
    async fn open(&self, _id: &ServerId) -> io::Result<Arc<dyn WorkspaceFsDyn>> {
        let closed = Arc::new(AtomicBool::new(false));
        *self.last_closed.lock() = Some(closed.clone());
        Ok(Arc::new(StubFs {
            files: self.files.clone(),
            closed,
        }))
    }
}

fn workspace_files() -> HashMap<String, Vec<u8>> {
    HashMap::from([
        ("README.md".to_string(), b"# demo".to_vec()),
        ("src/main.rs".to_string(), b"fn main() {}".to_vec()),
        ("src/lib.rs".to_string(), b"pub fn lib() {}".to_vec()),
    ])
}

// ─────────────────────────────────────────────────────────────────────────
// Sessions and telemetry doubles
// ─────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TestSessions {
    map: Mutex<HashMap<ContextKey, Vec<SessionHandle>>>,
}

impl TestSessions {
    fn register(
        &self,
        context: &ContextKey,
        name: &str,
    ) -> mpsc::UnboundedReceiver<RpcNotification> {
        let (handle, rx) = SessionHandle::new(name);
        self.map.lock().entry(context.clone()).or_default().push(handle);
        rx
    }
}

impl ClientSessions for TestSessions {
    fn active_sessions(&self, context: &ContextKey) -> Vec<SessionHandle> {
        self.map.lock().get(context).cloned().unwrap_or_default()
    }
}

#[derive(Default)]
struct TestTelemetry {
    events: Mutex<Vec<Value>>,
}

impl TelemetrySink for TestTelemetry {
    fn record(&self, event: Value) {
        self.events.lock().push(event);
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────

struct Harness {
    proxy: Arc<Proxy>,
    control: BackendControl,
    sessions: Arc<TestSessions>,
    telemetry: Arc<TestTelemetry>,
    /// Closed flag of the most recently opened workspace filesystem.
    fs_last_closed: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

fn fast_config() -> ProxyConfig {
    ProxyConfig {
        init_timeout: Duration::from_millis(500),
        shutdown_timeout: Duration::from_millis(500),
    }
}

fn harness(script: BackendScript) -> Harness {
    harness_with_config(script, fast_config())
}

fn harness_with_config(script: BackendScript, config: ProxyConfig) -> Harness {
    let (dialer, control) = mem_dialer(script);
    let sessions = Arc::new(TestSessions::default());
    let telemetry = Arc::new(TestTelemetry::default());
    let fs_last_closed = Arc::new(Mutex::new(None));
    let provider = StubFsProvider {
        files: workspace_files(),
        last_closed: fs_last_closed.clone(),
    };
    let proxy = Proxy::new(
        config,
        dialer,
        provider,
        sessions.clone(),
        telemetry.clone(),
    );
    Harness {
        proxy,
        control,
        sessions,
        telemetry,
        fs_last_closed,
    }
}

fn server_id(root: &str, mode: &str, prefix: &str) -> ServerId {
    ServerId::new(ContextKey::new(root, mode), prefix)
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Duration::from_secs(5);
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if timeout(deadline, poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Call routing
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn routed_call_reaches_backend() {
    let h = harness(BackendScript::default());
    let id = server_id("git://repoA?rev1", "go", "");

    let result = h
        .proxy
        .call(&id, "echo", Some(json!({"n": 7})), CALL_DEADLINE)
        .await
        .unwrap();
    assert_eq!(result, json!({"n": 7}));

    assert_eq!(h.control.dials.load(Ordering::SeqCst), 1);
    assert_eq!(h.control.log.initializes.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.connection_count(), 1);
    assert_eq!(h.proxy.metrics().open_connections(), 1);
    assert_eq!(h.proxy.metrics().connections_total(), 1);

    let stats = h.proxy.stats_for(&id).unwrap();
    assert_eq!(stats.total_count, 1);
    assert_eq!(stats.counts["echo"], 1);
    assert_eq!(stats.total_error_count, 0);
}

#[tokio::test]
async fn second_call_reuses_the_connection() {
    let h = harness(BackendScript::default());
    let id = server_id("git://repoA?rev1", "go", "");

    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    h.proxy.call(&id, "echo", Some(json!(2)), CALL_DEADLINE).await.unwrap();

    assert_eq!(h.control.dials.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.stats_for(&id).unwrap().counts["echo"], 2);
}

#[tokio::test]
async fn distinct_identities_get_distinct_connections() {
    let h = harness(BackendScript::default());
    // Same workspace context, one scoped to a subdirectory.
    let plain = server_id("git://repoA?rev1", "go", "");
    let scoped = server_id("git://repoA?rev1", "go", "/sub");

    let a = h.proxy.call(&plain, "echo", Some(json!("a")), CALL_DEADLINE);
    let b = h.proxy.call(&scoped, "echo", Some(json!("b")), CALL_DEADLINE);
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    assert_eq!(h.control.dials.load(Ordering::SeqCst), 2);
    assert_eq!(h.proxy.connection_count(), 2);
    assert!(h.proxy.stats_for(&plain).is_some());
    assert!(h.proxy.stats_for(&scoped).is_some());
}

#[tokio::test]
async fn routed_call_failure_is_recorded_but_not_fatal() {
    let h = harness(BackendScript::default());
    let id = server_id("git://repoA?rev1", "go", "");

    let err = h.proxy.call(&id, "boom", None, CALL_DEADLINE).await.unwrap_err();
    assert!(matches!(err, ProxyError::Call { .. }));

    // The failure is per-call: the connection survives and serves more.
    assert_eq!(h.proxy.connection_count(), 1);
    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.control.dials.load(Ordering::SeqCst), 1);

    let stats = h.proxy.stats_for(&id).unwrap();
    assert_eq!(stats.total_error_count, 1);
    assert_eq!(stats.error_counts["boom"], 1);
    assert_eq!(stats.counts["boom"], 1);
    assert_eq!(stats.counts["echo"], 1);
}

#[tokio::test]
async fn caller_deadline_is_enforced() {
    let h = harness(BackendScript {
        echo_delay: Some(Duration::from_millis(500)),
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");

    let err = h
        .proxy
        .call(&id, "echo", Some(json!(1)), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::DeadlineExceeded { .. }));

    let stats = h.proxy.stats_for(&id).unwrap();
    assert_eq!(stats.error_counts["echo"], 1);
}

// ─────────────────────────────────────────────────────────────────────────
// One-time initialization
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_first_calls_initialize_once() {
    let h = harness(BackendScript {
        init_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");

    let mut tasks = Vec::new();
    for n in 0..8 {
        let proxy = h.proxy.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            proxy.call(&id, "echo", Some(json!(n)), CALL_DEADLINE).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.control.dials.load(Ordering::SeqCst), 1);
    assert_eq!(h.control.log.initializes.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.connection_count(), 1);
}

#[tokio::test]
async fn failed_init_fails_all_waiters_one_direct_rest_wrapped() {
    let h = harness(BackendScript {
        fail_init: true,
        init_delay: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let proxy = h.proxy.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            proxy.call(&id, "echo", None, CALL_DEADLINE).await
        }));
    }

    let mut direct = 0;
    let mut shared = 0;
    for task in tasks {
        match task.await.unwrap() {
            Err(ProxyError::InitFailed(_)) => direct += 1,
            Err(ProxyError::SharedInit(_)) => shared += 1,
            other => panic!("expected init failure, got {other:?}"),
        }
    }

    // Exactly one caller ran the dial + handshake; the rest observed it.
    assert_eq!(h.control.dials.load(Ordering::SeqCst), 1);
    assert_eq!(direct, 1);
    assert_eq!(shared, 5);
    assert_eq!(h.proxy.connection_count(), 0);
}

#[tokio::test]
async fn failed_init_is_not_cached() {
    let h = harness(BackendScript {
        fail_init: true,
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");

    let err = h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap_err();
    assert!(matches!(err, ProxyError::InitFailed(_)));
    assert_eq!(h.proxy.connection_count(), 0);

    // The backend recovers; the next call dials fresh and succeeds.
    h.control.script.lock().fail_init = false;
    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.control.dials.load(Ordering::SeqCst), 2);
    assert_eq!(h.proxy.connection_count(), 1);
}

#[tokio::test]
async fn dial_failure_is_not_cached() {
    let h = harness(BackendScript::default());
    h.control.fail_dial.store(true, Ordering::SeqCst);
    let id = server_id("git://repoA?rev1", "go", "");

    let err = h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap_err();
    match err {
        ProxyError::InitFailed(cause) => {
            assert!(matches!(cause.as_ref(), ProxyError::Dial { .. }));
        }
        other => panic!("expected InitFailed(Dial), got {other:?}"),
    }
    assert_eq!(h.proxy.connection_count(), 0);

    h.control.fail_dial.store(false, Ordering::SeqCst);
    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.proxy.connection_count(), 1);
}

#[tokio::test]
async fn handshake_timeout_discards_the_connection() {
    let h = harness_with_config(
        BackendScript {
            hang_init: true,
            ..Default::default()
        },
        ProxyConfig {
            init_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(500),
        },
    );
    let id = server_id("git://repoA?rev1", "go", "");

    let err = h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap_err();
    match err {
        ProxyError::InitFailed(cause) => {
            assert!(matches!(cause.as_ref(), ProxyError::InitTimeout { .. }));
        }
        other => panic!("expected InitFailed(InitTimeout), got {other:?}"),
    }
    assert_eq!(h.proxy.connection_count(), 0);

    // A follow-up call triggers a fresh dial.
    h.control.script.lock().hang_init = false;
    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.control.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn backend_disconnect_removes_the_connection() {
    let h = harness(BackendScript {
        close_after_init: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");

    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.proxy.connection_count(), 1);

    let proxy = h.proxy.clone();
    wait_until("disconnect-driven removal", move || {
        proxy.connection_count() == 0
    })
    .await;
}

// ─────────────────────────────────────────────────────────────────────────
// Explicit shutdown
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn explicit_shutdown_retires_the_connection() {
    let h = harness(BackendScript::default());
    let id = server_id("git://repoA?rev1", "go", "");

    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    h.proxy.shutdown(&id).await.unwrap();

    assert_eq!(h.proxy.connection_count(), 0);
    assert_eq!(h.control.log.shutdowns.load(Ordering::SeqCst), 1);
    let fs_closed = h.fs_last_closed.lock().clone().unwrap();
    assert!(fs_closed.load(Ordering::SeqCst));

    // The exit notification drains through the writer asynchronously.
    let log = h.control.log.clone();
    wait_until("backend to see exit", move || {
        log.exits.load(Ordering::SeqCst) == 1
    })
    .await;

    // Removal is terminal: the next call builds a brand-new connection.
    h.proxy.call(&id, "echo", Some(json!(2)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.control.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_of_unknown_identity_is_a_noop() {
    let h = harness(BackendScript::default());
    let id = server_id("git://nowhere?rev0", "go", "");

    h.proxy.shutdown(&id).await.unwrap();
    assert_eq!(h.control.dials.load(Ordering::SeqCst), 0);
    assert_eq!(h.proxy.connection_count(), 0);
}

#[tokio::test]
async fn shutdown_all_drains_the_registry() {
    let h = harness(BackendScript::default());
    let a = server_id("git://repoA?rev1", "go", "");
    let b = server_id("git://repoB?rev1", "rust", "");

    h.proxy.call(&a, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    h.proxy.call(&b, "echo", Some(json!(2)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.proxy.connection_count(), 2);

    h.proxy.shutdown_all().await.unwrap();
    assert_eq!(h.proxy.connection_count(), 0);
    assert_eq!(h.proxy.metrics().open_connections(), 0);

    let log = h.control.log.clone();
    wait_until("both backends to see exit", move || {
        log.exits.load(Ordering::SeqCst) == 2
    })
    .await;
}

// ─────────────────────────────────────────────────────────────────────────
// Idle eviction
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_sweep_reaps_only_stale_connections() {
    let h = harness(BackendScript::default());
    let old = server_id("git://repoA?rev1", "go", "");
    let fresh = server_id("git://repoB?rev1", "go", "");

    h.proxy.call(&old, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.proxy.call(&fresh, "echo", Some(json!(2)), CALL_DEADLINE).await.unwrap();

    h.proxy.shutdown_idle(Duration::from_millis(100)).await.unwrap();

    assert_eq!(h.proxy.connection_count(), 1);
    assert!(h.proxy.stats_for(&old).is_none());
    assert!(h.proxy.stats_for(&fresh).is_some());
    assert_eq!(h.control.log.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idle_sweep_spares_active_connections() {
    let h = harness(BackendScript::default());
    let id = server_id("git://repoA?rev1", "go", "");

    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    h.proxy.shutdown_idle(Duration::from_secs(60)).await.unwrap();

    assert_eq!(h.proxy.connection_count(), 1);
    assert_eq!(h.control.log.shutdowns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reaped_identity_gets_a_fresh_connection() {
    let h = harness(BackendScript::default());
    let id = server_id("git://repoA?rev1", "go", "");

    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.proxy.shutdown_idle(Duration::from_millis(50)).await.unwrap();
    assert_eq!(h.proxy.connection_count(), 0);

    h.proxy.call(&id, "echo", Some(json!(2)), CALL_DEADLINE).await.unwrap();
    assert_eq!(h.control.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reaper_loop_sweeps_periodically() {
    let h = harness(BackendScript::default());
    let id = server_id("git://repoA?rev1", "go", "");

    h.proxy.call(&id, "echo", Some(json!(1)), CALL_DEADLINE).await.unwrap();

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let reaper = Reaper::new(
        h.proxy.clone(),
        Duration::from_millis(50),
        Duration::from_millis(30),
    );
    let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));

    let proxy = h.proxy.clone();
    wait_until("reaper to evict the idle connection", move || {
        proxy.connection_count() == 0
    })
    .await;

    shutdown.notify_one();
    reaper_task.await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────

/// Find the probe response with the given id, waiting for it to arrive.
async fn probe_response(log: &Arc<BackendLog>, id: i64) -> Value {
    let found = Arc::new(Mutex::new(None));
    let log = log.clone();
    let found_in = found.clone();
    wait_until("probe response", move || {
        let responses = log.probe_responses.lock();
        if let Some(resp) = responses.iter().find(|r| r["id"] == json!(id)) {
            *found_in.lock() = Some(resp.clone());
            true
        } else {
            false
        }
    })
    .await;
    let value = found.lock().take();
    value.unwrap()
}

#[tokio::test]
async fn dispatcher_serves_filesystem_reads() {
    let h = harness(BackendScript {
        probes: vec![
            ("fs/readFile".into(), json!("src/main.rs")), // 900
            ("fs/stat".into(), json!("src/main.rs")),     // 901
            ("fs/lstat".into(), json!("README.md")),      // 902
            ("fs/readDir".into(), json!("src")),          // 903
            ("fs/readDirFiles".into(), json!("src")),     // 904
        ],
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");
    h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap();

    let read = probe_response(&h.control.log, 900).await;
    assert_eq!(read["result"], json!(BASE64.encode(b"fn main() {}")));

    let stat = probe_response(&h.control.log, 901).await;
    assert_eq!(stat["result"]["name"], "main.rs");
    assert_eq!(stat["result"]["size"], 12);
    assert_eq!(stat["result"]["dir"], false);

    let lstat = probe_response(&h.control.log, 902).await;
    assert_eq!(lstat["result"]["name"], "README.md");

    let dir = probe_response(&h.control.log, 903).await;
    let names: Vec<&str> = dir["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["lib.rs", "main.rs"]);

    let dir_files = probe_response(&h.control.log, 904).await;
    assert_eq!(
        dir_files["result"]["main.rs"],
        json!(BASE64.encode(b"fn main() {}"))
    );
    assert_eq!(
        dir_files["result"]["lib.rs"],
        json!(BASE64.encode(b"pub fn lib() {}"))
    );
}

#[tokio::test]
async fn dispatcher_reports_missing_files() {
    let h = harness(BackendScript {
        probes: vec![("fs/readFile".into(), json!("no/such/file.rs"))],
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");
    h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap();

    let resp = probe_response(&h.control.log, 900).await;
    assert_eq!(resp["error"]["code"], -32004);
}

#[tokio::test]
async fn dispatcher_rejects_unrecognized_methods() {
    let h = harness(BackendScript {
        probes: vec![
            ("workspace/executeCommand".into(), json!({"command": "x"})),
            ("fs/readFile".into(), json!(42)), // not a string path
        ],
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");
    h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap();

    let unknown = probe_response(&h.control.log, 900).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let bad_params = probe_response(&h.control.log, 901).await;
    assert_eq!(bad_params["error"]["code"], -32602);
}

#[tokio::test]
async fn dispatcher_forwards_telemetry() {
    let h = harness(BackendScript {
        telemetry: Some(json!({"span": "compile", "durationMs": 12})),
        ..Default::default()
    });
    let id = server_id("git://repoA?rev1", "go", "");
    h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap();

    let telemetry = h.telemetry.clone();
    wait_until("telemetry hand-off", move || {
        !telemetry.events.lock().is_empty()
    })
    .await;

    let events = h.telemetry.events.lock();
    assert_eq!(events[0]["span"], "compile");
}

// ─────────────────────────────────────────────────────────────────────────
// Broadcast fan-out
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn diagnostics_reach_every_matching_session_and_no_others() {
    let h = harness(BackendScript {
        diagnostics: Some(json!({"uri": "file:///a.rs", "diagnostics": [{"message": "bad"}]})),
        ..Default::default()
    });

    let ctx_a = ContextKey::new("git://repoA?rev1", "go");
    let ctx_b = ContextKey::new("git://repoB?rev1", "go");
    let mut rx_a1 = h.sessions.register(&ctx_a, "a1");
    let mut rx_a2 = h.sessions.register(&ctx_a, "a2");
    let mut rx_b = h.sessions.register(&ctx_b, "b");

    let id = ServerId::new(ctx_a.clone(), "");
    h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap();

    for rx in [&mut rx_a1, &mut rx_a2] {
        let note = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("diagnostics should be fanned out")
            .unwrap();
        assert_eq!(note.method, "textDocument/publishDiagnostics");
        assert_eq!(note.params.as_ref().unwrap()["uri"], "file:///a.rs");
    }

    // Sessions on other workspaces see nothing.
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn dead_session_does_not_break_fan_out() {
    let h = harness(BackendScript {
        diagnostics: Some(json!({"uri": "file:///a.rs", "diagnostics": []})),
        ..Default::default()
    });

    let ctx = ContextKey::new("git://repoA?rev1", "go");
    let dead_rx = h.sessions.register(&ctx, "dead");
    drop(dead_rx); // recipient went away without unregistering
    let mut live_rx = h.sessions.register(&ctx, "live");

    let id = ServerId::new(ctx.clone(), "");
    h.proxy.call(&id, "echo", None, CALL_DEADLINE).await.unwrap();

    let note = timeout(Duration::from_secs(5), live_rx.recv())
        .await
        .expect("live session should still receive diagnostics")
        .unwrap();
    assert_eq!(note.method, "textDocument/publishDiagnostics");
}
