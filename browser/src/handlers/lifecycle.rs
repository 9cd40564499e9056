use crate::BrowserError;
use crate::Result;
use crate::cdp::CdpTransport;
use crate::config::LaunchOptions;
use crate::executable;
use crate::handlers::parse;
use crate::handlers::session_from;
use crate::launcher;
use crate::launcher::LaunchedProcess;
use crate::page::Page;
use crate::registry::SessionRegistry;
use crate::session::BrowserMode;
use crate::session::Session;
use chromiumoxide::Browser;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::browser::HeadlessMode;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a session: resolve a browser, launch it, attach the automation
/// library and the raw transport, wire event capture, register. Every failure
/// branch tears down whatever was already created, so a caller never observes a
/// half-launched session or a leaked process.
pub async fn launch(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let options: LaunchOptions = parse(params)?;
    let session_id = uuid::Uuid::new_v4().to_string();

    let (mode, kind, browser, handler_task, process, ws_endpoint) =
        match executable::resolve(options.executable.as_deref()) {
            Some(exe) => {
                info!(
                    "session {session_id}: native launch using {}",
                    exe.path.display()
                );
                let kind = exe.kind;
                let mut process = launcher::launch(&options, exe).await?;
                let ws = process.ws_endpoint.clone();
                match attach(&ws).await {
                    Ok((browser, handler_task)) => (
                        BrowserMode::Native,
                        Some(kind),
                        browser,
                        handler_task,
                        Some(process),
                        ws,
                    ),
                    Err(e) => {
                        process.stop().await;
                        return Err(e);
                    }
                }
            }
            None if options.requires_native() => {
                // The caller pinned a profile/port/executable that only a
                // native launch can honor; no fallback.
                return Err(BrowserError::ExecutableNotFound);
            }
            None => {
                info!("session {session_id}: no native executable, using bundled launch");
                let (browser, handler_task) = launch_bundled(&options).await?;
                let ws = browser.websocket_address().to_string();
                (BrowserMode::Bundled, None, browser, handler_task, None, ws)
            }
        };

    match finish_launch(
        session_id.clone(),
        mode,
        browser,
        handler_task,
        process,
        ws_endpoint,
        &options,
    )
    .await
    {
        Ok(session) => {
            let data = json!({
                "sessionId": session.id,
                "browser": session.mode,
                "executable": kind,
                "debugPort": session.debug_port,
                "downloadDir": session.download_dir().display().to_string(),
            });
            registry.insert(session).await;
            Ok(data)
        }
        Err(e) => Err(e),
    }
}

/// Everything after a browser handle exists. On failure the session object
/// itself runs the teardown so cleanup order stays in one place.
async fn finish_launch(
    session_id: String,
    mode: BrowserMode,
    browser: Browser,
    handler_task: JoinHandle<()>,
    process: Option<LaunchedProcess>,
    ws_endpoint: String,
    options: &LaunchOptions,
) -> Result<Arc<Session>> {
    let debug_port = process.as_ref().map(|p| p.debug_port);

    let transport = match CdpTransport::connect(&ws_endpoint).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            abort_partial(browser, handler_task, process).await;
            return Err(e);
        }
    };

    let cdp_page = match acquire_page(&browser).await {
        Ok(page) => page,
        Err(e) => {
            transport.close().await;
            abort_partial(browser, handler_task, process).await;
            return Err(e);
        }
    };

    let page = Arc::new(Page::new(cdp_page, options));
    if let Err(e) = page.apply_overrides(options).await {
        transport.close().await;
        abort_partial(browser, handler_task, process).await;
        return Err(e);
    }

    let download_dir = options
        .download_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("skipper-downloads-{session_id}")));
    if let Err(e) = tokio::fs::create_dir_all(&download_dir).await {
        transport.close().await;
        abort_partial(browser, handler_task, process).await;
        return Err(e.into());
    }

    let session = Arc::new(Session::new(
        session_id,
        mode,
        debug_port,
        browser,
        handler_task,
        page,
        transport,
        process,
        download_dir,
    ));

    if let Err(e) = session.wire_capture().await {
        session.teardown().await;
        return Err(e);
    }

    Ok(session)
}

async fn attach(ws: &str) -> Result<(Browser, JoinHandle<()>)> {
    let connect = Browser::connect(ws.to_string());
    let (browser, mut handler) = timeout(ATTACH_TIMEOUT, connect)
        .await
        .map_err(|_| {
            BrowserError::Timeout(format!(
                "automation attach to {ws} after {}ms",
                ATTACH_TIMEOUT.as_millis()
            ))
        })?
        .map_err(|e| BrowserError::CdpError(format!("automation attach failed: {e}")))?;
    let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });
    Ok((browser, handler_task))
}

/// Fallback when no native executable is available and none was demanded:
/// let the automation library manage the process and a throwaway profile.
async fn launch_bundled(options: &LaunchOptions) -> Result<(Browser, JoinHandle<()>)> {
    let mut builder = BrowserConfig::builder()
        .window_size(options.viewport.width, options.viewport.height)
        .arg("--disable-blink-features=AutomationControlled");
    if options.headless {
        builder = builder.headless_mode(HeadlessMode::New);
    } else {
        builder = builder.with_head();
    }
    if options.no_sandbox {
        builder = builder.no_sandbox();
    }
    let config = builder
        .build()
        .map_err(|e| BrowserError::LaunchFailed(format!("bundled launch config: {e}")))?;

    let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
        BrowserError::LaunchFailed(format!(
            "bundled launch failed (is a Chromium-based browser installed?): {e}"
        ))
    })?;
    let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });
    Ok((browser, handler_task))
}

/// A native launch always opens a blank target, so prefer the existing tab;
/// a bundled launch may start empty.
async fn acquire_page(browser: &Browser) -> Result<chromiumoxide::Page> {
    let pages = browser.pages().await?;
    match pages.into_iter().next() {
        Some(page) => Ok(page),
        None => {
            debug!("no existing targets, opening about:blank");
            Ok(browser.new_page("about:blank").await?)
        }
    }
}

async fn abort_partial(
    mut browser: Browser,
    handler_task: JoinHandle<()>,
    process: Option<LaunchedProcess>,
) {
    if let Err(e) = timeout(Duration::from_secs(5), browser.close()).await {
        warn!("browser close during launch abort timed out: {e}");
    }
    handler_task.abort();
    if let Some(mut process) = process {
        process.stop().await;
    }
}

pub async fn list(registry: &SessionRegistry) -> Result<Value> {
    let mut sessions = Vec::new();
    for session in registry.list().await {
        let url = session.page().current_url().await.ok();
        sessions.push(json!({
            "sessionId": session.id,
            "browser": session.mode,
            "createdAt": session.created_at,
            "url": url,
            "debugPort": session.debug_port,
        }));
    }
    Ok(json!({ "sessions": sessions }))
}

/// Removal from the registry happens first, so a racing second close observes
/// not-found instead of a session mid-teardown.
pub async fn close(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let session = session_from(registry, &params).await?;
    let session = registry.remove(&session.id).await?;
    session.teardown().await;
    Ok(json!({ "closed": true }))
}
