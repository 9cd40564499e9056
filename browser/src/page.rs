use crate::BrowserError;
use crate::Result;
use crate::config::ImageFormat;
use crate::config::LaunchOptions;
use crate::config::WaitStrategy;
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::emulation;
use chromiumoxide::cdp::browser_protocol::input::DispatchKeyEventParams;
use chromiumoxide::cdp::browser_protocol::input::DispatchKeyEventType;
use chromiumoxide::cdp::browser_protocol::input::DispatchMouseEventParams;
use chromiumoxide::cdp::browser_protocol::input::DispatchMouseEventType;
use chromiumoxide::cdp::browser_protocol::input::MouseButton;
use chromiumoxide::cdp::browser_protocol::network;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotParams;
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::page::Page as CdpPage;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use tracing::info;

/// Wrapper over the automation library's page handle. Raw input dispatch and
/// CDP passthrough live here; ref resolution and session state do not.
pub struct Page {
    cdp_page: Arc<CdpPage>,
    format: ImageFormat,
    viewport_width: u32,
    viewport_height: u32,
    wait: WaitStrategy,
}

impl Page {
    pub fn new(cdp_page: CdpPage, options: &LaunchOptions) -> Self {
        Self {
            cdp_page: Arc::new(cdp_page),
            format: ImageFormat::Png,
            viewport_width: options.viewport.width,
            viewport_height: options.viewport.height,
            wait: options.wait.clone(),
        }
    }

    pub fn cdp(&self) -> &Arc<CdpPage> {
        &self.cdp_page
    }

    /// Apply environment overrides (UA, accept-language, timezone, locale,
    /// device metrics) right after page creation. Each is a one-shot push;
    /// re-applying with different values is the only reset.
    pub async fn apply_overrides(&self, options: &LaunchOptions) -> Result<()> {
        // Network domain must be enabled before header/UA overrides, and the
        // session relies on it for request capture anyway.
        self.cdp_page
            .execute(network::EnableParams::default())
            .await?;

        if let Some(ua) = &options.user_agent {
            let mut builder = network::SetUserAgentOverrideParams::builder().user_agent(ua);
            if let Some(al) = &options.accept_language {
                builder = builder.accept_language(al);
            }
            let params = builder.build().map_err(BrowserError::CdpError)?;
            self.cdp_page.execute(params).await?;
        }

        if let Some(tz) = &options.timezone {
            self.cdp_page
                .execute(emulation::SetTimezoneOverrideParams {
                    timezone_id: tz.clone(),
                })
                .await?;
        }

        if let Some(locale) = &options.locale {
            let params = emulation::SetLocaleOverrideParams::builder()
                .locale(locale)
                .build();
            self.cdp_page.execute(params).await?;
        }

        let params = emulation::SetDeviceMetricsOverrideParams::builder()
            .width(options.viewport.width as i64)
            .height(options.viewport.height as i64)
            .device_scale_factor(options.viewport.device_scale_factor)
            .mobile(options.viewport.mobile)
            .build()
            .map_err(BrowserError::CdpError)?;
        self.cdp_page.execute(params).await?;

        Ok(())
    }

    pub async fn goto(&self, url: &str, wait: Option<WaitStrategy>) -> Result<GotoResult> {
        info!("navigating to {url}");
        let wait_strategy = wait.unwrap_or_else(|| self.wait.clone());

        self.cdp_page.goto(url).await?;

        match wait_strategy {
            WaitStrategy::Event(event) => match event.as_str() {
                "domcontentloaded" => {
                    self.cdp_page.wait_for_navigation().await?;
                }
                "load" => {
                    self.cdp_page.wait_for_navigation().await?;
                    tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
                }
                "networkidle" | "networkidle0" => {
                    tokio::time::sleep(tokio::time::Duration::from_millis(1000)).await;
                }
                "networkidle2" => {
                    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
                }
                _ => {
                    return Err(BrowserError::InvalidRequest(format!(
                        "unknown wait event: {event}"
                    )));
                }
            },
            WaitStrategy::Delay { delay_ms } => {
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }

        let title = self.cdp_page.get_title().await.ok().flatten();
        let final_url = self
            .current_url()
            .await
            .unwrap_or_else(|_| url.to_string());

        Ok(GotoResult {
            url: final_url,
            title,
        })
    }

    pub async fn current_url(&self) -> Result<String> {
        match self.cdp_page.url().await? {
            Some(url) => Ok(url),
            None => Err(BrowserError::CdpError("page has no URL yet".to_string())),
        }
    }

    pub async fn title(&self) -> Option<String> {
        self.cdp_page.get_title().await.ok().flatten()
    }

    pub async fn reload(&self) -> Result<()> {
        self.cdp_page
            .execute(chromiumoxide::cdp::browser_protocol::page::ReloadParams::default())
            .await?;
        self.cdp_page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn go_back(&self) -> Result<()> {
        let _ = self.inject_js("history.back()").await?;
        Ok(())
    }

    pub async fn go_forward(&self) -> Result<()> {
        let _ = self.inject_js("history.forward()").await?;
        Ok(())
    }

    /// Plain evaluate, no harness. For internal probes.
    pub async fn inject_js(&self, script: &str) -> Result<Value> {
        let result = self.cdp_page.evaluate(script).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    /// Execute caller-supplied JavaScript inside a harness that captures
    /// console output, page errors, and URL changes alongside the value.
    pub async fn execute_javascript(&self, code: &str) -> Result<Value> {
        debug!(
            "executing JavaScript: {}",
            code.chars().take(120).collect::<String>()
        );

        let wrapped = format!(
            r#"(async () => {{
  const meta = {{ startTs: Date.now(), urlBefore: location.href }};
  const logs = [];
  const errors = [];
  const orig = {{ log: console.log, warn: console.warn, error: console.error }};

  function normalize(v, depth = 0) {{
    if (depth > 3) return '[truncated]';
    if (v === undefined) return null;
    if (v === null || typeof v === 'number' || typeof v === 'boolean') return v;
    if (typeof v === 'string') return v.length > 4000 ? v.slice(0, 4000) + '…' : v;
    if (typeof v === 'function') return '[function ' + (v.name || 'anonymous') + ']';
    if (typeof Element !== 'undefined' && v instanceof Element) {{
      return {{ tag: v.tagName, id: v.id || null, text: (v.textContent || '').trim().slice(0, 200) }};
    }}
    try {{ return JSON.parse(JSON.stringify(v)); }} catch (_) {{}}
    if (Array.isArray(v)) return v.slice(0, 50).map(x => normalize(x, depth + 1));
    return String(v);
  }}

  for (const level of ['log', 'warn', 'error']) {{
    console[level] = (...args) => {{
      logs.push({{ level, args: args.map(a => normalize(a)) }});
      orig[level](...args);
    }};
  }}
  window.addEventListener('error', e => errors.push(String(e.error || e.message || e)));
  window.addEventListener('unhandledrejection', e => errors.push('unhandledrejection: ' + String(e.reason)));

  try {{
    const AsyncFunction = Object.getPrototypeOf(async function () {{}}).constructor;
    const run = new AsyncFunction('"use strict"; return eval(arguments[0]);');
    const raw = await run({code});
    return {{
      success: true,
      value: normalize(raw),
      logs,
      errors,
      meta: {{ urlBefore: meta.urlBefore, urlAfter: location.href, durationMs: Date.now() - meta.startTs }}
    }};
  }} catch (err) {{
    return {{ success: false, value: null, error: String(err), logs, errors }};
  }} finally {{
    console.log = orig.log; console.warn = orig.warn; console.error = orig.error;
  }}
}})()"#,
            code = serde_json::to_string(code)?
        );

        let result = self.cdp_page.evaluate(wrapped).await?;
        let value = result.value().cloned().unwrap_or(Value::Null);

        // Scripts often trigger navigation (element.click(), location
        // changes); give it a beat before downstream snapshots.
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        Ok(value)
    }

    pub async fn screenshot(&self, mode: ScreenshotMode) -> Result<Vec<Screenshot>> {
        match mode {
            ScreenshotMode::Viewport => self.screenshot_viewport().await,
            ScreenshotMode::FullPage { segments_max } => {
                self.screenshot_fullpage(segments_max).await
            }
        }
    }

    async fn screenshot_viewport(&self) -> Result<Vec<Screenshot>> {
        let probe = self
            .inject_js(
                "(() => ({ w: document.documentElement.clientWidth|0, h: document.documentElement.clientHeight|0 }))()",
            )
            .await
            .unwrap_or(Value::Null);
        let doc_w = probe.get("w").and_then(Value::as_u64).unwrap_or(0) as u32;
        let doc_h = probe.get("h").and_then(Value::as_u64).unwrap_or(0) as u32;
        let width = if doc_w > 0 { doc_w } else { self.viewport_width };
        let height = if doc_h > 0 { doc_h } else { self.viewport_height };

        let builder = CaptureScreenshotParams::builder()
            .format(self.capture_format())
            .capture_beyond_viewport(true)
            .clip(chromiumoxide::cdp::browser_protocol::page::Viewport {
                x: 0.0,
                y: 0.0,
                width: width as f64,
                height: height as f64,
                scale: 1.0,
            });

        let data = self.capture_with_retry(builder).await?;
        Ok(vec![Screenshot {
            data,
            width,
            height,
            format: self.format,
        }])
    }

    async fn screenshot_fullpage(&self, segments_max: usize) -> Result<Vec<Screenshot>> {
        let lm = self.cdp_page.layout_metrics().await?;
        let content = lm.css_content_size;
        let doc_w = content.width.ceil() as u32;
        let doc_h = content.height.ceil() as u32;

        let width = self.viewport_width.min(doc_w.max(1));
        let slice_height = self.viewport_height;

        let mut shots = Vec::new();
        let mut y = 0u32;
        while y < doc_h && shots.len() < segments_max {
            let height = slice_height.min(doc_h - y);
            let builder = CaptureScreenshotParams::builder()
                .format(self.capture_format())
                .capture_beyond_viewport(true)
                .clip(chromiumoxide::cdp::browser_protocol::page::Viewport {
                    x: 0.0,
                    y: y as f64,
                    width: width as f64,
                    height: height as f64,
                    scale: 1.0,
                });
            let data = self.capture_with_retry(builder).await?;
            shots.push(Screenshot {
                data,
                width,
                height,
                format: self.format,
            });
            y += height;
        }

        if shots.len() == segments_max && y < doc_h {
            info!("full-page capture truncated at {segments_max} segments");
        }
        Ok(shots)
    }

    /// from_surface(false) avoids flashing a visible window; it fails when
    /// the window is hidden, so retry with from_surface(true).
    async fn capture_with_retry(
        &self,
        builder: chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotParamsBuilder,
    ) -> Result<Vec<u8>> {
        let first = builder.clone().from_surface(false).build();
        let resp = match self.cdp_page.execute(first).await {
            Ok(resp) => resp.result,
            Err(e) => {
                debug!("screenshot with from_surface(false) failed: {e}, retrying");
                self.cdp_page
                    .execute(builder.from_surface(true).build())
                    .await?
                    .result
            }
        };
        let data_b64: &str = resp.data.as_ref();
        base64::engine::general_purpose::STANDARD
            .decode(data_b64.as_bytes())
            .map_err(|e| BrowserError::CdpError(format!("screenshot base64 decode failed: {e}")))
    }

    fn capture_format(&self) -> CaptureScreenshotFormat {
        match self.format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Webp => CaptureScreenshotFormat::Webp,
        }
    }

    pub async fn pdf(&self) -> Result<Vec<u8>> {
        let resp = self.cdp_page.execute(PrintToPdfParams::default()).await?;
        let data_b64: &str = resp.result.data.as_ref();
        base64::engine::general_purpose::STANDARD
            .decode(data_b64.as_bytes())
            .map_err(|e| BrowserError::CdpError(format!("pdf base64 decode failed: {e}")))
    }

    pub async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(BrowserError::CdpError)?;
        self.cdp_page.execute(params).await?;
        Ok(())
    }

    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        debug!("clicking at ({x}, {y})");
        self.move_mouse(x, y).await?;
        self.mouse_button(DispatchMouseEventType::MousePressed, x, y).await?;
        self.mouse_button(DispatchMouseEventType::MouseReleased, x, y).await?;
        Ok(())
    }

    /// Press at `from`, glide to `to` in steps, release. Real drag semantics
    /// need intermediate moves or drop targets never see dragover.
    pub async fn drag(&self, from: (f64, f64), to: (f64, f64)) -> Result<()> {
        debug!("dragging from {from:?} to {to:?}");
        self.move_mouse(from.0, from.1).await?;
        self.mouse_button(DispatchMouseEventType::MousePressed, from.0, from.1)
            .await?;

        const STEPS: usize = 8;
        for i in 1..=STEPS {
            let t = i as f64 / STEPS as f64;
            let x = from.0 + (to.0 - from.0) * t;
            let y = from.1 + (to.1 - from.1) * t;
            self.move_mouse(x, y).await?;
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        self.mouse_button(DispatchMouseEventType::MouseReleased, to.0, to.1)
            .await?;
        Ok(())
    }

    async fn mouse_button(&self, kind: DispatchMouseEventType, x: f64, y: f64) -> Result<()> {
        let params = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::CdpError)?;
        self.cdp_page.execute(params).await?;
        Ok(())
    }

    /// Type into the currently focused element, one char event per character.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        for ch in text.chars() {
            let params = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::Char)
                .text(ch.to_string())
                .build()
                .map_err(BrowserError::CdpError)?;
            self.cdp_page.execute(params).await?;
        }
        Ok(())
    }

    /// Press a named key ("Enter", "Tab", "Escape", "ArrowDown", ...).
    pub async fn press_key(&self, key: &str) -> Result<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let params = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key(key.to_string())
                .build()
                .map_err(BrowserError::CdpError)?;
            self.cdp_page.execute(params).await?;
        }
        Ok(())
    }

    pub async fn scroll_by(&self, dx: f64, dy: f64) -> Result<Value> {
        self.inject_js(&format!(
            "(() => {{ window.scrollBy({dx}, {dy}); return {{ x: window.scrollX, y: window.scrollY }}; }})()"
        ))
        .await
    }

    /// Arbitrary CDP command at page-session scope.
    pub async fn execute_cdp_raw(&self, method: &str, params: Value) -> Result<Value> {
        #[derive(Debug, Clone)]
        struct RawCdpCommand {
            method: String,
            params: Value,
        }
        impl serde::Serialize for RawCdpCommand {
            fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                self.params.serialize(serializer)
            }
        }
        impl chromiumoxide_types::Method for RawCdpCommand {
            fn identifier(&self) -> chromiumoxide_types::MethodId {
                self.method.clone().into()
            }
        }
        impl chromiumoxide_types::Command for RawCdpCommand {
            type Response = Value;
        }

        let cmd = RawCdpCommand {
            method: method.to_string(),
            params,
        };
        let resp = self.cdp_page.execute(cmd).await?;
        Ok(resp.result)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ScreenshotMode {
    Viewport,
    FullPage { segments_max: usize },
}

#[derive(Debug)]
pub struct Screenshot {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

#[derive(Debug, serde::Serialize)]
pub struct GotoResult {
    pub url: String,
    pub title: Option<String>,
}
