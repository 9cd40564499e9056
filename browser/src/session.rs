use crate::Result;
use crate::cdp::CdpTransport;
use crate::launcher::LaunchedProcess;
use crate::page::Page;
use crate::snapshot::RoleRef;
use chromiumoxide::Browser;
use chromiumoxide::cdp::browser_protocol::network::EventLoadingFailed;
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::cdp::browser_protocol::network::EventResponseReceived;
use chromiumoxide::cdp::browser_protocol::page::EventJavascriptDialogOpening;
use chromiumoxide::cdp::browser_protocol::page::HandleJavaScriptDialogParams;
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::cdp::js_protocol::runtime::EventExceptionThrown;
use chrono::DateTime;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const CONSOLE_CAPACITY: usize = 100;
pub const ERROR_CAPACITY: usize = 50;
pub const NETWORK_CAPACITY: usize = 1000;

/// Fixed-capacity, oldest-evicted-first collection. Bounds per-session memory
/// regardless of how long a page stays busy.
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageError {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub resource_type: Option<String>,
    pub status: Option<i64>,
    pub ok: Option<bool>,
    pub request_headers: Value,
    pub response_headers: Option<Value>,
    pub failure_text: Option<String>,
    /// Protocol-level id, kept for response-body retrieval only; URL matching
    /// stays the correlation rule for status updates.
    #[serde(skip)]
    pub cdp_request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogOutcome {
    #[serde(rename = "type")]
    pub dialog_type: String,
    pub message: String,
    pub handled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEvent {
    pub url: String,
    pub suggested_filename: String,
    pub guid: String,
    pub path: Option<String>,
}

/// One-shot dialog continuation: consumed by the next dialog event or cleared
/// by its own timeout, never both.
struct PendingDialog {
    id: u64,
    accept: bool,
    prompt_text: Option<String>,
    tx: oneshot::Sender<DialogOutcome>,
}

struct PendingDownload {
    id: u64,
    tx: oneshot::Sender<DownloadEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    /// We spawned the OS process ourselves and own its lifecycle.
    Native,
    /// The automation library manages the process.
    Bundled,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("created_at", &self.created_at)
            .field("debug_port", &self.debug_port)
            .finish_non_exhaustive()
    }
}

/// One orchestrator-managed browser+page pair. All transient state lives
/// here; nothing about a session is global.
pub struct Session {
    pub id: String,
    pub mode: BrowserMode,
    pub created_at: DateTime<Utc>,
    pub debug_port: Option<u16>,
    browser: Mutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    page: Arc<Page>,
    transport: Arc<CdpTransport>,
    process: Mutex<Option<LaunchedProcess>>,
    download_dir: PathBuf,

    role_refs: Mutex<HashMap<String, RoleRef>>,
    console_messages: Arc<Mutex<RingBuffer<ConsoleMessage>>>,
    page_errors: Arc<Mutex<RingBuffer<PageError>>>,
    network_requests: Arc<Mutex<RingBuffer<NetworkRequestRecord>>>,
    network_seq: Arc<AtomicU64>,
    pending_dialog: Arc<Mutex<Option<PendingDialog>>>,
    pending_downloads: Arc<Mutex<VecDeque<PendingDownload>>>,
    waiter_seq: AtomicU64,
    pub is_tracing: AtomicBool,

    /// Serializes actions within this session; cross-session concurrency is
    /// unlimited.
    action_lock: Mutex<()>,
    capture_tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        mode: BrowserMode,
        debug_port: Option<u16>,
        browser: Browser,
        handler_task: JoinHandle<()>,
        page: Arc<Page>,
        transport: Arc<CdpTransport>,
        process: Option<LaunchedProcess>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            mode,
            created_at: Utc::now(),
            debug_port,
            browser: Mutex::new(Some(browser)),
            handler_task: Mutex::new(Some(handler_task)),
            page,
            transport,
            process: Mutex::new(process),
            download_dir,
            role_refs: Mutex::new(HashMap::new()),
            console_messages: Arc::new(Mutex::new(RingBuffer::new(CONSOLE_CAPACITY))),
            page_errors: Arc::new(Mutex::new(RingBuffer::new(ERROR_CAPACITY))),
            network_requests: Arc::new(Mutex::new(RingBuffer::new(NETWORK_CAPACITY))),
            network_seq: Arc::new(AtomicU64::new(1)),
            pending_dialog: Arc::new(Mutex::new(None)),
            pending_downloads: Arc::new(Mutex::new(VecDeque::new())),
            waiter_seq: AtomicU64::new(1),
            is_tracing: AtomicBool::new(false),
            action_lock: Mutex::new(()),
            capture_tasks: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn transport(&self) -> &Arc<CdpTransport> {
        &self.transport
    }

    pub fn download_dir(&self) -> &PathBuf {
        &self.download_dir
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub async fn lock_actions(&self) -> Result<MutexGuard<'_, ()>> {
        if self.is_closing() {
            return Err(crate::BrowserError::SessionClosing);
        }
        Ok(self.action_lock.lock().await)
    }

    // ---- snapshot refs ------------------------------------------------

    /// Replace the ref map wholesale. Refs from earlier snapshots become
    /// unresolvable from this point on.
    pub async fn replace_refs(&self, refs: HashMap<String, RoleRef>) {
        *self.role_refs.lock().await = refs;
    }

    pub async fn lookup_ref(&self, token: &str) -> Option<RoleRef> {
        self.role_refs.lock().await.get(token).cloned()
    }

    pub async fn ref_count(&self) -> usize {
        self.role_refs.lock().await.len()
    }

    // ---- buffered events ----------------------------------------------

    pub async fn console_tail(&self, limit: Option<usize>) -> Vec<ConsoleMessage> {
        let buffer = self.console_messages.lock().await;
        tail(buffer.iter().cloned().collect(), limit)
    }

    pub async fn errors_tail(&self, limit: Option<usize>) -> Vec<PageError> {
        let buffer = self.page_errors.lock().await;
        tail(buffer.iter().cloned().collect(), limit)
    }

    pub async fn network_records(
        &self,
        url_filter: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<NetworkRequestRecord> {
        let buffer = self.network_requests.lock().await;
        let records = buffer
            .iter()
            .filter(|r| url_filter.is_none_or(|f| r.url.contains(f)))
            .cloned()
            .collect();
        tail(records, limit)
    }

    /// Newest record whose URL contains `pattern`.
    pub async fn find_response(&self, pattern: &str) -> Option<NetworkRequestRecord> {
        let buffer = self.network_requests.lock().await;
        buffer.iter().rev().find(|r| r.url.contains(pattern)).cloned()
    }

    // ---- one-shot waiters ----------------------------------------------

    /// Install the dialog continuation. At most one may be pending; an
    /// existing one is displaced and its waiter rejected immediately.
    pub async fn install_dialog_handler(
        &self,
        accept: bool,
        prompt_text: Option<String>,
    ) -> (u64, oneshot::Receiver<DialogOutcome>) {
        let id = self.waiter_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let mut slot = self.pending_dialog.lock().await;
        if slot.is_some() {
            warn!("session {}: displacing pending dialog handler", self.id);
        }
        *slot = Some(PendingDialog {
            id,
            accept,
            prompt_text,
            tx,
        });
        (id, rx)
    }

    /// Clear the slot on the timeout path, but only if it still holds the
    /// waiter that timed out.
    pub async fn clear_dialog_handler(&self, id: u64) {
        let mut slot = self.pending_dialog.lock().await;
        if slot.as_ref().is_some_and(|p| p.id == id) {
            *slot = None;
        }
    }

    pub async fn push_download_waiter(&self) -> (u64, oneshot::Receiver<DownloadEvent>) {
        let id = self.waiter_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_downloads
            .lock()
            .await
            .push_back(PendingDownload { id, tx });
        (id, rx)
    }

    pub async fn remove_download_waiter(&self, id: u64) {
        self.pending_downloads.lock().await.retain(|w| w.id != id);
    }

    // ---- event capture --------------------------------------------------

    /// Wire capture once at session creation. Each task owns clones of the
    /// exact buffers and slots it mutates; none of them holds the session.
    pub async fn wire_capture(&self) -> Result<()> {
        let mut tasks = self.capture_tasks.lock().await;
        let cdp_page = self.page.cdp();

        // Console messages.
        let mut console_events = cdp_page.event_listener::<EventConsoleApiCalled>().await?;
        let console_buffer = Arc::clone(&self.console_messages);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let level = serde_json::to_value(&event.r#type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "log".to_string());
                let text = event
                    .args
                    .iter()
                    .map(|arg| match (&arg.value, &arg.description) {
                        (Some(v), _) => stringify_console_value(v),
                        (None, Some(d)) => d.clone(),
                        _ => "<object>".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                console_buffer.lock().await.push(ConsoleMessage {
                    timestamp: Utc::now(),
                    level,
                    text,
                });
            }
        }));

        // Uncaught page errors.
        let mut error_events = cdp_page.event_listener::<EventExceptionThrown>().await?;
        let error_buffer = Arc::clone(&self.page_errors);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = error_events.next().await {
                let details = &event.exception_details;
                let message = details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| details.text.clone());
                error_buffer.lock().await.push(PageError {
                    timestamp: Utc::now(),
                    message,
                });
            }
        }));

        // Network: request sent.
        let mut request_events = cdp_page.event_listener::<EventRequestWillBeSent>().await?;
        let request_buffer = Arc::clone(&self.network_requests);
        let seq = Arc::clone(&self.network_seq);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = request_events.next().await {
                let record = NetworkRequestRecord {
                    id: seq.fetch_add(1, Ordering::SeqCst),
                    timestamp: Utc::now(),
                    method: event.request.method.clone(),
                    url: event.request.url.clone(),
                    resource_type: serde_json::to_value(&event.r#type)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string)),
                    status: None,
                    ok: None,
                    request_headers: serde_json::to_value(&event.request.headers)
                        .unwrap_or(Value::Null),
                    response_headers: None,
                    failure_text: None,
                    cdp_request_id: Some(event.request_id.as_ref().to_string()),
                };
                request_buffer.lock().await.push(record);
            }
        }));

        // Network: response received. Correlated by URL equality against the
        // first record still lacking a status, a documented trade-off that
        // assumes no overlapping identical URLs in flight.
        let mut response_events = cdp_page.event_listener::<EventResponseReceived>().await?;
        let response_buffer = Arc::clone(&self.network_requests);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = response_events.next().await {
                let mut buffer = response_buffer.lock().await;
                if let Some(record) = buffer
                    .iter_mut()
                    .find(|r| r.status.is_none() && r.url == event.response.url)
                {
                    record.status = Some(event.response.status);
                    record.ok = Some((200..400).contains(&event.response.status));
                    record.response_headers =
                        serde_json::to_value(&event.response.headers).ok();
                }
            }
        }));

        // Network: failures carry no URL at the protocol level, so they match
        // on the retained request id.
        let mut failure_events = cdp_page.event_listener::<EventLoadingFailed>().await?;
        let failure_buffer = Arc::clone(&self.network_requests);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = failure_events.next().await {
                let request_id = event.request_id.as_ref().to_string();
                let mut buffer = failure_buffer.lock().await;
                if let Some(record) = buffer
                    .iter_mut()
                    .find(|r| r.cdp_request_id.as_deref() == Some(request_id.as_str()))
                {
                    record.failure_text = Some(event.error_text.clone());
                    record.ok = Some(false);
                }
            }
        }));

        // Dialogs: consume the pending handler if one is installed, otherwise
        // auto-dismiss so automation never deadlocks on a prompt.
        let mut dialog_events = cdp_page
            .event_listener::<EventJavascriptDialogOpening>()
            .await?;
        let dialog_slot = Arc::clone(&self.pending_dialog);
        let dialog_page = Arc::clone(cdp_page);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = dialog_events.next().await {
                let pending = dialog_slot.lock().await.take();
                let dialog_type = serde_json::to_value(&event.r#type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "alert".to_string());

                match pending {
                    Some(handler) => {
                        let result = dialog_page
                            .execute(HandleJavaScriptDialogParams {
                                accept: handler.accept,
                                prompt_text: handler.prompt_text.clone(),
                            })
                            .await;
                        if let Err(e) = result {
                            warn!("failed to handle dialog: {e}");
                        }
                        let _ = handler.tx.send(DialogOutcome {
                            dialog_type,
                            message: event.message.clone(),
                            handled: true,
                        });
                    }
                    None => {
                        debug!("auto-dismissing unexpected {dialog_type} dialog");
                        let result = dialog_page
                            .execute(HandleJavaScriptDialogParams {
                                accept: false,
                                prompt_text: None,
                            })
                            .await;
                        if let Err(e) = result {
                            warn!("failed to auto-dismiss dialog: {e}");
                        }
                    }
                }
            }
        }));

        // Downloads arrive on the raw browser-scope transport. The first
        // queued waiter is matched to the next event regardless of which
        // action triggered it (strictly-sequential assumption; see DESIGN).
        self.transport
            .send(
                "Browser.setDownloadBehavior",
                json!({
                    "behavior": "allow",
                    "downloadPath": self.download_dir.display().to_string(),
                    "eventsEnabled": true,
                }),
            )
            .await?;
        let mut download_events = self.transport.subscribe("Browser.downloadWillBegin").await;
        let download_queue = Arc::clone(&self.pending_downloads);
        let download_dir = self.download_dir.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(params) = download_events.recv().await {
                let suggested = params
                    .get("suggestedFilename")
                    .and_then(Value::as_str)
                    .unwrap_or("download")
                    .to_string();
                let event = DownloadEvent {
                    url: params
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    guid: params
                        .get("guid")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    path: Some(download_dir.join(&suggested).display().to_string()),
                    suggested_filename: suggested,
                };
                match download_queue.lock().await.pop_front() {
                    Some(waiter) => {
                        let _ = waiter.tx.send(event);
                    }
                    None => debug!("download began with no waiter queued: {}", event.url),
                }
            }
        }));

        Ok(())
    }

    // ---- teardown -------------------------------------------------------

    /// Tear down page → browser → OS process, in that order, cancelling every
    /// outstanding wait scoped to this session. Runs effectively once.
    pub async fn teardown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing session {}", self.id);

        for task in self.capture_tasks.lock().await.drain(..) {
            task.abort();
        }

        // Dropping the senders rejects the waiters.
        *self.pending_dialog.lock().await = None;
        self.pending_downloads.lock().await.clear();

        self.transport.close().await;

        if let Some(mut browser) = self.browser.lock().await.take() {
            match timeout(Duration::from_secs(5), browser.close()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("browser close failed for session {}: {e}", self.id),
                Err(_) => warn!("browser close timed out for session {}", self.id),
            }
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            task.abort();
        }

        if let Some(mut process) = self.process.lock().await.take() {
            process.stop().await;
        }
    }

    /// Liveness of the native process, for tests and `list`.
    pub async fn native_process_stopped(&self) -> Option<bool> {
        self.process.lock().await.as_ref().map(LaunchedProcess::is_stopped)
    }
}

fn tail<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}

fn stringify_console_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ring_buffer_evicts_oldest_first() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn ring_buffer_holds_most_recent_thousand() {
        let mut ring = RingBuffer::new(NETWORK_CAPACITY);
        for i in 0..1500u64 {
            ring.push(i);
        }
        assert_eq!(ring.len(), NETWORK_CAPACITY);
        assert_eq!(ring.iter().next().copied(), Some(500));
        assert_eq!(ring.iter().last().copied(), Some(1499));
    }

    #[test]
    fn tail_keeps_the_newest_entries() {
        assert_eq!(tail(vec![1, 2, 3, 4], Some(2)), vec![3, 4]);
        assert_eq!(tail(vec![1, 2], Some(5)), vec![1, 2]);
        assert_eq!(tail(vec![1, 2], None), vec![1, 2]);
    }

    #[test]
    fn console_values_render_bare_strings() {
        assert_eq!(stringify_console_value(&Value::String("hi".into())), "hi");
        assert_eq!(stringify_console_value(&serde_json::json!(42)), "42");
        assert_eq!(
            stringify_console_value(&serde_json::json!({"a": 1})),
            r#"{"a":1}"#
        );
    }
}
