use crate::BrowserError;
use crate::Result;
use crate::handlers::parse;
use crate::registry::SessionRegistry;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use std::sync::atomic::Ordering;
use tokio::time::Duration;
use tokio::time::timeout;
use tracing::debug;

const TRACE_COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CATEGORIES: &str =
    "devtools.timeline,disabled-by-default-devtools.timeline,blink.user_timing,loading";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceStartParams {
    session_id: String,
    #[serde(default)]
    categories: Option<String>,
}

pub async fn trace_start(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: TraceStartParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    if session.is_tracing.swap(true, Ordering::SeqCst) {
        return Err(BrowserError::InvalidRequest(
            "tracing is already active for this session".to_string(),
        ));
    }

    let categories = body
        .categories
        .unwrap_or_else(|| DEFAULT_CATEGORIES.to_string());
    let result = session
        .transport()
        .send(
            "Tracing.start",
            json!({
                "categories": categories,
                "transferMode": "ReturnAsStream",
                "streamFormat": "json",
            }),
        )
        .await;
    if let Err(e) = result {
        session.is_tracing.store(false, Ordering::SeqCst);
        return Err(e);
    }
    Ok(json!({ "tracing": true, "categories": categories }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceStopParams {
    session_id: String,
    path: String,
}

/// End tracing and drain the result stream to a file. The completion event is
/// awaited before `Tracing.end` is issued so it cannot be missed.
pub async fn trace_stop(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: TraceStopParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    if !session.is_tracing.load(Ordering::SeqCst) {
        return Err(BrowserError::InvalidRequest(
            "tracing is not active for this session".to_string(),
        ));
    }

    let complete = session.transport().wait_for_event("Tracing.tracingComplete").await;
    session.transport().send("Tracing.end", json!({})).await?;

    let completion = timeout(TRACE_COMPLETE_TIMEOUT, complete)
        .await
        .map_err(|_| {
            BrowserError::Timeout(format!(
                "tracingComplete after {}ms",
                TRACE_COMPLETE_TIMEOUT.as_millis()
            ))
        })?
        .map_err(|_| BrowserError::ConnectionClosed)?;

    session.is_tracing.store(false, Ordering::SeqCst);

    let stream = completion
        .get("stream")
        .and_then(Value::as_str)
        .ok_or_else(|| BrowserError::CdpError("tracingComplete carried no stream".to_string()))?
        .to_string();

    let data = read_stream(session.transport(), &stream).await?;
    tokio::fs::write(&body.path, &data).await?;
    Ok(json!({ "path": body.path, "bytes": data.len() }))
}

async fn read_stream(
    transport: &crate::cdp::CdpTransport,
    handle: &str,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let chunk = transport
            .send("IO.read", json!({ "handle": handle, "size": 1_048_576 }))
            .await?;
        let part = chunk.get("data").and_then(Value::as_str).unwrap_or_default();
        if chunk
            .get("base64Encoded")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(part.as_bytes())
                .map_err(|e| BrowserError::CdpError(format!("trace stream decode: {e}")))?;
            data.extend_from_slice(&decoded);
        } else {
            data.extend_from_slice(part.as_bytes());
        }
        if chunk.get("eof").and_then(Value::as_bool).unwrap_or(true) {
            break;
        }
    }
    if let Err(e) = transport.send("IO.close", json!({ "handle": handle })).await {
        debug!("IO.close failed: {e}");
    }
    Ok(data)
}

#[derive(Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum CdpScope {
    #[default]
    Page,
    Browser,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpParams {
    session_id: String,
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    scope: CdpScope,
}

/// Raw protocol passthrough for introspection needs the typed surface does
/// not cover. Page scope goes through the automation library's session;
/// browser scope goes over the session's own transport.
pub async fn cdp_passthrough(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: CdpParams = parse(params)?;
    if body.method.is_empty() {
        return Err(BrowserError::InvalidRequest("method is required".to_string()));
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let args = body.params.unwrap_or_else(|| json!({}));
    let result = match body.scope {
        CdpScope::Page => session.page().execute_cdp_raw(&body.method, args).await?,
        CdpScope::Browser => session.transport().send(&body.method, args).await?,
    };
    Ok(result)
}
