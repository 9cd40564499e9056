use crate::BrowserError;
use crate::Result;
use crate::handlers::input::TargetParam;
use crate::handlers::input::resolve_target;
use crate::handlers::parse;
use crate::page::ScreenshotMode;
use crate::registry::SessionRegistry;
use crate::snapshot;
use crate::snapshot::SnapshotMode;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotParams {
    session_id: String,
    #[serde(default)]
    mode: SnapshotMode,
}

pub async fn snapshot(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: SnapshotParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let result = snapshot::capture(&session, body.mode).await?;
    Ok(serde_json::to_value(result)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractParams {
    session_id: String,
    #[serde(flatten)]
    target: TargetParam,
    #[serde(default)]
    format: ExtractFormat,
}

#[derive(Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum ExtractFormat {
    #[default]
    Text,
    Html,
}

pub async fn extract(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: ExtractParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let has_target = body.target.reference.is_some() || body.target.selector.is_some();
    let content = if has_target {
        let handle = resolve_target(&session, &body.target).await?;
        let getter = match body.format {
            ExtractFormat::Text => "function() { return this.innerText; }",
            ExtractFormat::Html => "function() { return this.outerHTML; }",
        };
        snapshot::call_on_element(session.page(), &handle, getter).await?
    } else {
        let getter = match body.format {
            ExtractFormat::Text => "document.body ? document.body.innerText : ''",
            ExtractFormat::Html => "document.documentElement.outerHTML",
        };
        session.page().inject_js(getter).await?
    };
    Ok(json!({ "content": content }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteParams {
    session_id: String,
    code: String,
}

pub async fn execute(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: ExecuteParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    session.page().execute_javascript(&body.code).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotParams {
    session_id: String,
    #[serde(default)]
    full_page: bool,
    #[serde(default = "default_segments_max")]
    segments_max: usize,
    #[serde(default)]
    path: Option<String>,
}

fn default_segments_max() -> usize {
    8
}

pub async fn screenshot(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: ScreenshotParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let mode = if body.full_page {
        ScreenshotMode::FullPage {
            segments_max: body.segments_max,
        }
    } else {
        ScreenshotMode::Viewport
    };
    let shots = session.page().screenshot(mode).await?;
    let first = shots
        .first()
        .ok_or_else(|| BrowserError::CdpError("no screenshot data".to_string()))?;

    if let Some(path) = &body.path {
        tokio::fs::write(path, &first.data).await?;
        for (i, shot) in shots.iter().enumerate().skip(1) {
            let segmented = segment_path(path, i + 1);
            tokio::fs::write(&segmented, &shot.data).await?;
            debug!("wrote screenshot segment {segmented}");
        }
    }

    Ok(json!({
        "data": base64::engine::general_purpose::STANDARD.encode(&first.data),
        "width": first.width,
        "height": first.height,
        "segments": shots.len(),
        "path": body.path,
    }))
}

fn segment_path(path: &str, index: usize) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{index}.{ext}"),
        None => format!("{path}-{index}"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PdfParams {
    session_id: String,
    #[serde(default)]
    path: Option<String>,
}

pub async fn pdf(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: PdfParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let bytes = session.page().pdf().await?;
    let data = match &body.path {
        Some(path) => {
            tokio::fs::write(path, &bytes).await?;
            None
        }
        None => Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
    };
    Ok(json!({ "bytes": bytes.len(), "path": body.path, "data": data }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TailParams {
    session_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn console(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: TailParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let messages = session.console_tail(body.limit).await;
    Ok(json!({ "messages": messages }))
}

pub async fn errors(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: TailParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let errors = session.errors_tail(body.limit).await;
    Ok(json!({ "errors": errors }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkParams {
    session_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn network(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: NetworkParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let records = session
        .network_records(body.url.as_deref(), body.limit)
        .await;
    Ok(json!({ "requests": records }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseParams {
    session_id: String,
    url: String,
}

/// Return the newest captured record matching the URL pattern, with its body
/// when the browser still retains it.
pub async fn response(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: ResponseParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let record = session.find_response(&body.url).await.ok_or_else(|| {
        BrowserError::ElementNotFound(format!("no captured request matches {}", body.url))
    })?;

    let mut payload = serde_json::to_value(&record)?;
    if let Some(request_id) = &record.cdp_request_id {
        match session
            .page()
            .execute_cdp_raw("Network.getResponseBody", json!({ "requestId": request_id }))
            .await
        {
            Ok(result) => {
                payload["body"] = result.get("body").cloned().unwrap_or(Value::Null);
                payload["base64Encoded"] =
                    result.get("base64Encoded").cloned().unwrap_or(json!(false));
            }
            Err(e) => {
                // Bodies are evicted once the browser drops the resource.
                debug!("response body unavailable for {}: {e}", record.url);
                payload["body"] = Value::Null;
            }
        }
    }
    Ok(payload)
}
