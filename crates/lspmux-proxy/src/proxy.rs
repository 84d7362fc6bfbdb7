//! The connection registry and call router.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use lspmux_protocol::{InitializeParams, Methods, ServerId};
use lspmux_transport::{Dialer, DialerDyn, RpcPeer, TransportError};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::conn::ServerConn;
use crate::dispatch::Dispatcher;
use crate::error::{ErrorList, ProxyError};
use crate::metrics::ProxyMetrics;
use crate::stats::StatsSnapshot;
use crate::traits::{ClientSessions, FsProvider, FsProviderDyn, TelemetrySink};

/// Tunables for connection lifecycle. The defaults match production use;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Internal bound on the `initialize` handshake, applied independently
    /// of caller deadlines (the tighter of the two wins).
    pub init_timeout: Duration,
    /// Bound on the shutdown/exit exchange when retiring a connection.
    pub shutdown_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Process-wide proxy state: the set of live backend connections, keyed by
/// identity, plus the injected collaborator capabilities.
///
/// The registry lock guards only bookkeeping; no I/O ever happens while it
/// is held.
pub struct Proxy {
    config: ProxyConfig,
    servers: Mutex<HashMap<ServerId, Arc<ServerConn>>>,
    dialer: Arc<dyn DialerDyn>,
    fs_provider: Arc<dyn FsProviderDyn>,
    sessions: Arc<dyn ClientSessions>,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: ProxyMetrics,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        dialer: impl Dialer,
        fs_provider: impl FsProvider,
        sessions: Arc<dyn ClientSessions>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            servers: Mutex::new(HashMap::new()),
            dialer: Arc::new(dialer),
            fs_provider: Arc::new(fs_provider),
            sessions,
            telemetry,
            metrics: ProxyMetrics::new(),
        })
    }

    /// Route one call to the backend serving `id`, creating and
    /// initializing the connection if needed. `deadline` bounds the whole
    /// operation, including a first-use dial and handshake.
    pub async fn call(
        self: &Arc<Self>,
        id: &ServerId,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, ProxyError> {
        match tokio::time::timeout(deadline, self.call_inner(id, method, params)).await {
            Ok(result) => result,
            Err(_) => {
                // Record the timeout against the connection if one was
                // resolved before the deadline hit.
                if let Some(conn) = self.lookup(id) {
                    conn.stats.lock().inc_method_error(method);
                }
                Err(ProxyError::DeadlineExceeded {
                    method: method.to_string(),
                    deadline,
                })
            }
        }
    }

    async fn call_inner(
        self: &Arc<Self>,
        id: &ServerId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ProxyError> {
        let conn = self.get_or_create(id).await?;

        {
            let mut stats = conn.stats.lock();
            stats.touch();
            stats.inc_method(method);
        }

        let peer = match conn.transport.get() {
            Some(peer) => peer.clone(),
            None => {
                // Initialization succeeded but the transport is already
                // gone — the connection raced with a removal.
                return Err(ProxyError::Call {
                    method: method.to_string(),
                    source: TransportError::Closed,
                });
            }
        };

        match peer.call(method, params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                conn.stats.lock().inc_method_error(method);
                Err(ProxyError::Call {
                    method: method.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Find or register the connection for `id`, then drive its one-time
    /// initialization. Exactly one concurrent caller executes the init
    /// sequence; the rest wait on the same guard and share the outcome.
    async fn get_or_create(self: &Arc<Self>, id: &ServerId) -> Result<Arc<ServerConn>, ProxyError> {
        let conn = {
            let mut servers = self.servers.lock();
            match servers.get(id) {
                Some(existing) => existing.clone(),
                None => {
                    // Only the cheap bookkeeping happens under the lock;
                    // dial and handshake run after it is released.
                    let conn = Arc::new(ServerConn::new(id.clone()));
                    servers.insert(id.clone(), conn.clone());
                    self.metrics.connection_opened();
                    debug!("registered backend connection {id}");
                    conn
                }
            }
        };

        self.ensure_initialized(&conn).await?;
        Ok(conn)
    }

    async fn ensure_initialized(
        self: &Arc<Self>,
        conn: &Arc<ServerConn>,
    ) -> Result<(), ProxyError> {
        // Whether WE (not a concurrent caller) executed the init sequence.
        let did_init = AtomicBool::new(false);

        let outcome = conn
            .init
            .get_or_init(|| {
                did_init.store(true, Ordering::SeqCst);
                let proxy = self.clone();
                let conn = conn.clone();
                async move { proxy.connect_and_initialize(conn).await.map_err(Arc::new) }
            })
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(cause) => {
                if did_init.load(Ordering::SeqCst) {
                    // Fail every waiter with the same error, but deregister
                    // the connection so a future call retries fresh instead
                    // of hitting a permanently poisoned entry.
                    self.remove_conn(conn);
                    Err(ProxyError::InitFailed(cause.clone()))
                } else {
                    // The executor already removed the connection; report
                    // distinctly that no duplicate dial happened here.
                    Err(ProxyError::SharedInit(cause.clone()))
                }
            }
        }
    }

    /// The one-time init sequence: dial, attach the dispatcher, open the
    /// workspace filesystem, perform the `initialize` handshake.
    async fn connect_and_initialize(
        self: Arc<Self>,
        conn: Arc<ServerConn>,
    ) -> Result<(), ProxyError> {
        let stream = self.dialer.dial_dyn(&conn.id).await.map_err(|e| ProxyError::Dial {
            id: conn.id.to_string(),
            source: e,
        })?;
        conn.touch();

        let dispatcher = Dispatcher::new(
            conn.id.clone(),
            conn.stats.clone(),
            conn.fs.clone(),
            self.sessions.clone(),
            self.telemetry.clone(),
        );
        let peer = RpcPeer::connect(stream, dispatcher);

        let fs = match self.fs_provider.open_dyn(&conn.id).await {
            Ok(fs) => fs,
            Err(e) => {
                peer.close();
                return Err(ProxyError::OpenFs {
                    id: conn.id.to_string(),
                    source: e,
                });
            }
        };
        let _ = conn.fs.set(fs);

        let params = InitializeParams::new(
            conn.id.context.root_uri.clone(),
            conn.id.context.mode.clone(),
        );
        let params = serde_json::to_value(&params).map_err(|e| ProxyError::Initialize {
            id: conn.id.to_string(),
            source: TransportError::Encode(e),
        })?;

        let handshake = peer.call(Methods::INITIALIZE, Some(params));
        match tokio::time::timeout(self.config.init_timeout, handshake).await {
            Ok(Ok(_capabilities)) => {}
            Ok(Err(e)) => {
                self.abandon_init(&conn, &peer).await;
                return Err(ProxyError::Initialize {
                    id: conn.id.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                self.abandon_init(&conn, &peer).await;
                return Err(ProxyError::InitTimeout {
                    id: conn.id.to_string(),
                    timeout: self.config.init_timeout,
                });
            }
        }
        conn.touch();

        let _ = conn.transport.set(peer.clone());
        info!("backend connection ready {}", conn.id);

        // Drop the registry entry when the backend hangs up on its own.
        let proxy = Arc::downgrade(&self);
        let watched = conn.clone();
        tokio::spawn(async move {
            peer.closed().await;
            if let Some(proxy) = proxy.upgrade() {
                proxy.remove_conn(&watched);
            }
        });

        Ok(())
    }

    /// Best-effort cleanup for a connection whose handshake failed. The
    /// entry itself is removed by the init executor.
    async fn abandon_init(&self, conn: &Arc<ServerConn>, peer: &Arc<RpcPeer>) {
        if let Some(fs) = conn.fs.get() {
            let _ = fs.close_dyn().await;
        }
        peer.close();
    }

    /// Remove `conn` from the live set, if it is still the registered
    /// entry for its identity. Pointer-guarded so a stale cleanup never
    /// removes a fresh retry's connection.
    fn remove_conn(&self, conn: &Arc<ServerConn>) {
        let removed = {
            let mut servers = self.servers.lock();
            match servers.get(&conn.id) {
                Some(live) if Arc::ptr_eq(live, conn) => {
                    servers.remove(&conn.id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.finalize_removed(conn);
        }
    }

    /// Metrics and the machine-parseable removal log line. Called exactly
    /// once per removed connection.
    fn finalize_removed(&self, conn: &Arc<ServerConn>) {
        let snapshot = conn.stats_snapshot();
        self.metrics.connection_removed(conn.id.mode(), &snapshot);
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!("removed backend connection {}: {json}", conn.id),
            Err(_) => info!("removed backend connection {}", conn.id),
        }
    }

    /// Evict every connection idle longer than `max_idle`: remove it from
    /// the registry, then run the graceful shutdown sequence, concurrently
    /// across connections. Individual failures are collected, never fatal
    /// to the sweep.
    ///
    /// Idle means `last` strictly before the cutoff computed at sweep
    /// start; a connection exactly at the boundary survives the pass.
    pub async fn shutdown_idle(self: &Arc<Self>, max_idle: Duration) -> Result<(), ProxyError> {
        let Some(cutoff) = Instant::now().checked_sub(max_idle) else {
            return Ok(()); // threshold predates the process; nothing qualifies
        };

        let idle: Vec<Arc<ServerConn>> = {
            let servers = self.servers.lock();
            servers
                .values()
                .filter(|conn| conn.stats.lock().last < cutoff)
                .cloned()
                .collect()
        };
        // Lock released: shutting down a slow backend must never block the
        // registry.

        if idle.is_empty() {
            return Ok(());
        }
        debug!("idle sweep: retiring {} connection(s)", idle.len());

        let mut tasks = Vec::with_capacity(idle.len());
        for conn in idle {
            let proxy = self.clone();
            tasks.push(tokio::spawn(async move {
                // Remove first so no new caller can find the connection
                // while it is being torn down.
                proxy.remove_conn(&conn);
                conn.shutdown_and_exit(proxy.config.shutdown_timeout).await
            }));
        }

        let mut errs = ErrorList::default();
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errs.push(e),
                Err(e) => errs.push(ProxyError::Join(e)),
            }
        }
        errs.into_result()
    }

    /// Terminate the connection matching `id`. No-op (and no error) when
    /// no such connection exists.
    pub async fn shutdown(self: &Arc<Self>, id: &ServerId) -> Result<(), ProxyError> {
        let Some(conn) = self.lookup(id) else {
            return Ok(());
        };
        self.remove_conn(&conn);
        conn.shutdown_and_exit(self.config.shutdown_timeout).await
    }

    /// Drain the registry and retire every connection. Process-shutdown
    /// path; per-connection failures are aggregated.
    pub async fn shutdown_all(self: &Arc<Self>) -> Result<(), ProxyError> {
        let conns: Vec<Arc<ServerConn>> = {
            let mut servers = self.servers.lock();
            servers.drain().map(|(_, conn)| conn).collect()
        };
        if conns.is_empty() {
            return Ok(());
        }
        info!("shutting down {} backend connection(s)", conns.len());

        let mut tasks = Vec::with_capacity(conns.len());
        for conn in conns {
            self.finalize_removed(&conn);
            let timeout = self.config.shutdown_timeout;
            tasks.push(tokio::spawn(async move { conn.shutdown_and_exit(timeout).await }));
        }

        let mut errs = ErrorList::default();
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("backend shutdown: {e}");
                    errs.push(e);
                }
                Err(e) => errs.push(ProxyError::Join(e)),
            }
        }
        errs.into_result()
    }

    /// Number of live (initialized + uninitialized) connections.
    pub fn connection_count(&self) -> usize {
        self.servers.lock().len()
    }

    /// Statistics for the live connection serving `id`, if any.
    pub fn stats_for(&self, id: &ServerId) -> Option<StatsSnapshot> {
        self.lookup(id).map(|conn| conn.stats_snapshot())
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    fn lookup(&self, id: &ServerId) -> Option<Arc<ServerConn>> {
        self.servers.lock().get(id).cloned()
    }
}
