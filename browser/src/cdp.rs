use crate::BrowserError;
use crate::Result;
use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use serde_json::Value;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use tracing::warn;

/// Opening the WebSocket itself is bounded separately from command round-trips.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Every command gets its own deadline, independent of connection state.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = HashMap<i64, oneshot::Sender<std::result::Result<Value, String>>>;
type EventWaiters = HashMap<String, Vec<oneshot::Sender<Value>>>;
type EventSubscriptions = HashMap<String, Vec<mpsc::UnboundedSender<Value>>>;

/// Raw CDP connection: JSON-RPC-style command/response correlation plus
/// unsolicited event delivery. This sits beside the automation library for
/// introspection needs (tracing, downloads, browser-scope commands), not as
/// the primary command path.
pub struct CdpTransport {
    sink: Arc<Mutex<WsSink>>,
    pending: Arc<Mutex<PendingMap>>,
    event_waiters: Arc<Mutex<EventWaiters>>,
    subscriptions: Arc<Mutex<EventSubscriptions>>,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CdpTransport {
    /// Connect to a CDP WebSocket endpoint. Bounded by its own timeout so a
    /// half-launched browser cannot wedge session creation.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(ws_url))
            .await
            .map_err(|_| {
                BrowserError::Timeout(format!(
                    "CDP connect to {ws_url} after {}ms",
                    CONNECT_TIMEOUT.as_millis()
                ))
            })?
            .map_err(|e| BrowserError::CdpError(format!("CDP connect to {ws_url} failed: {e}")))?;

        let (sink, mut source) = stream.split();

        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let event_waiters: Arc<Mutex<EventWaiters>> = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: Arc<Mutex<EventSubscriptions>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let event_waiters = Arc::clone(&event_waiters);
            let subscriptions = Arc::clone(&subscriptions);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("CDP socket error: {e}");
                            break;
                        }
                    };
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        warn!("unparseable CDP frame: {text}");
                        continue;
                    };
                    route_frame(&pending, &event_waiters, &subscriptions, value).await;
                }
                closed.store(true, Ordering::SeqCst);
                fail_pending(&pending).await;
                event_waiters.lock().await.clear();
                subscriptions.lock().await.clear();
            })
        };

        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            pending,
            event_waiters,
            subscriptions,
            next_id: AtomicI64::new(1),
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Send a command and await its correlated response. On timeout the
    /// pending entry is removed before the error is surfaced; the command may
    /// still complete browser-side but the caller must treat it as failed.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({"id": id, "method": method, "params": params}).to_string();
        if let Err(e) = self.sink.lock().await.send(Message::Text(frame)).await {
            self.pending.lock().await.remove(&id);
            self.closed.store(true, Ordering::SeqCst);
            return Err(BrowserError::CdpError(format!("send {method} failed: {e}")));
        }

        match timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(BrowserError::CdpError(format!("{method}: {message}"))),
            Ok(Err(_)) => Err(BrowserError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BrowserError::Timeout(format!(
                    "{method} after {}ms",
                    COMMAND_TIMEOUT.as_millis()
                )))
            }
        }
    }

    /// One-shot wait for the next occurrence of an event method. The caller
    /// applies its own deadline to the receiver.
    pub async fn wait_for_event(&self, method: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.event_waiters
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Persistent subscription to an event method. The channel closes when
    /// the transport does.
    pub async fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the socket and reject everything still in flight. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        fail_pending(&self.pending).await;
        self.event_waiters.lock().await.clear();
        self.subscriptions.lock().await.clear();
    }
}

async fn route_frame(
    pending: &Arc<Mutex<PendingMap>>,
    event_waiters: &Arc<Mutex<EventWaiters>>,
    subscriptions: &Arc<Mutex<EventSubscriptions>>,
    frame: Value,
) {
    if let Some(id) = frame.get("id").and_then(Value::as_i64) {
        let Some(tx) = pending.lock().await.remove(&id) else {
            // Late reply after a command timeout; its entry is already gone.
            debug!("dropping reply for unknown command id {id}");
            return;
        };
        let outcome = if let Some(error) = frame.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown protocol error");
            Err(message.to_string())
        } else {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(outcome);
        return;
    }

    let Some(method) = frame.get("method").and_then(Value::as_str) else {
        return;
    };
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    if let Some(waiters) = event_waiters.lock().await.remove(method) {
        for tx in waiters {
            let _ = tx.send(params.clone());
        }
    }
    if let Some(subs) = subscriptions.lock().await.get_mut(method) {
        subs.retain(|tx| tx.send(params.clone()).is_ok());
    }
    // Everything else is an event nobody asked about; drop it.
}

/// No continuation may be left dangling: dropping the senders wakes every
/// in-flight `send` with a connection-closed error.
async fn fail_pending(pending: &Arc<Mutex<PendingMap>>) {
    let dropped = pending.lock().await.drain().count();
    if dropped > 0 {
        debug!("rejected {dropped} in-flight CDP commands on close");
    }
}
