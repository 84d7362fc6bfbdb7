//! One duplex JSON-RPC session over a framed byte stream.
//!
//! An [`RpcPeer`] owns a writer task (fed by an mpsc channel) and a reader
//! task that resolves pending outbound calls and routes inbound requests
//! and notifications to an [`InboundHandler`]. Callers apply their own
//! deadlines with `tokio::time::timeout`; `call` is cancellation-safe — a
//! dropped call removes its pending entry.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use lspmux_protocol::{HandlerResult, RequestId, RpcError, RpcNotification, RpcRequest, RpcResponse};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::frame;

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Trait implemented by the dispatcher for backend-originated traffic.
/// The peer calls this for every inbound request and notification.
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle an inbound request (or notification — no response is written
    /// for those) and return the result to send back.
    fn handle(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;
}

/// Object-safe wrapper for the InboundHandler trait.
trait InboundHandlerDyn: Send + Sync {
    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + 'a>>;
}

impl<T: InboundHandler> InboundHandlerDyn for T {
    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(self.handle(method, params))
    }
}

type PendingMap = Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>;

/// State shared between the peer handle and its reader/writer tasks.
struct Shared {
    pending: PendingMap,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn mark_closed(&self) {
        // send_replace: updates the value even when nobody is subscribed.
        self.closed_tx.send_replace(true);
        // Dropping the senders fails every in-flight call with Closed.
        self.pending.lock().clear();
    }
}

/// One live JSON-RPC session.
pub struct RpcPeer {
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<Bytes>,
    next_id: AtomicI64,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcPeer {
    /// Wrap an established duplex stream and start the reader/writer tasks.
    pub fn connect<S, H>(stream: S, handler: H) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        H: InboundHandler,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CHANNEL_CAPACITY);

        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed_tx,
        });

        // Writer task. Not aborted on close: it drains what is already
        // queued (the shutdown path's `exit` notification in particular)
        // before signing off.
        let mut writer_closed = shared.closed_tx.subscribe();
        let writer_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = outbound_rx.recv() => {
                        let Some(data) = data else { break };
                        if let Err(e) = write_half.write_all(&data).await {
                            warn!("transport write error: {e}");
                            break;
                        }
                        if let Err(e) = write_half.flush().await {
                            warn!("transport flush error: {e}");
                            break;
                        }
                    }
                    _ = writer_closed.changed() => {
                        while let Ok(data) = outbound_rx.try_recv() {
                            if write_half.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        let _ = write_half.flush().await;
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
            writer_shared.mark_closed();
        });

        // Reader task
        let reader_shared = shared.clone();
        let reader_outbound = outbound_tx.clone();
        let handler: Arc<dyn InboundHandlerDyn> = Arc::new(handler);
        let reader = tokio::spawn(async move {
            let mut buf = BufReader::new(read_half);
            loop {
                let msg = match frame::read_frame(&mut buf).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("transport read error: {e}");
                        break;
                    }
                };
                route_inbound(msg, &reader_shared, &handler, &reader_outbound);
            }
            reader_shared.mark_closed();
        });

        Arc::new(Self {
            shared,
            outbound_tx,
            next_id: AtomicI64::new(1),
            reader_task: Mutex::new(Some(reader)),
        })
    }

    /// Send a request and wait for the matching response.
    ///
    /// No internal timeout is applied — callers bound the wait with
    /// `tokio::time::timeout` and may drop the future at any point.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let req = RpcRequest::new(RequestId::Number(id), method, params);
        let framed = frame::encode_frame(&serde_json::to_value(&req)?)?;
        if self.outbound_tx.send(framed).await.is_err() {
            return Err(TransportError::Closed);
        }

        let outcome = rx.await.map_err(|_| TransportError::Closed)?;
        outcome.map_err(TransportError::Rpc)
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let note = RpcNotification::new(method, params);
        let framed = frame::encode_frame(&serde_json::to_value(&note)?)?;
        self.outbound_tx
            .send(framed)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Resolve once the session is closed (remote EOF, I/O error, or an
    /// explicit `close`).
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Tear the session down: fail in-flight calls, stop the reader, and
    /// let the writer drain its queue. Idempotent.
    pub fn close(&self) {
        self.shared.mark_closed();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for RpcPeer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes the pending entry if the call is dropped before its response
/// arrives, so an abandoned call does not leak map entries.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// Classify one inbound message and route it. Requests and notifications
/// run in their own task so a slow handler never stalls the read loop.
fn route_inbound(
    msg: Value,
    shared: &Arc<Shared>,
    handler: &Arc<dyn InboundHandlerDyn>,
    outbound: &mpsc::Sender<Bytes>,
) {
    let has_method = msg.get("method").is_some();
    let id = msg.get("id").cloned();

    match (has_method, id) {
        // Response to one of our outbound calls
        (false, Some(id)) => {
            let Some(id) = id.as_i64() else {
                warn!("response with non-numeric id: {id}");
                return;
            };
            let Some(tx) = shared.pending.lock().remove(&id) else {
                debug!("response for unknown call id {id} (call abandoned?)");
                return;
            };
            let outcome = match msg.get("error") {
                Some(err) => Err(serde_json::from_value::<RpcError>(err.clone())
                    .unwrap_or_else(|_| RpcError::internal("malformed error object"))),
                None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }

        // Inbound request — handle and respond
        (true, Some(id)) => {
            let Ok(id) = serde_json::from_value::<RequestId>(id) else {
                warn!("request with malformed id");
                return;
            };
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            let params = msg.get("params").cloned();
            let handler = handler.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let response = match handler.handle_dyn(&method, params).await {
                    Ok(result) => RpcResponse::success(id, result),
                    Err(e) => RpcResponse::error(Some(id), e),
                };
                if let Ok(value) = serde_json::to_value(&response) {
                    if let Ok(framed) = frame::encode_frame(&value) {
                        let _ = outbound.send(framed).await;
                    }
                }
            });
        }

        // Inbound notification — handle, nothing to send back
        (true, None) => {
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            let params = msg.get("params").cloned();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle_dyn(&method, params).await {
                    debug!("inbound notification {method}: {e}");
                }
            });
        }

        (false, None) => warn!("inbound message is neither request nor response"),
    }
}
