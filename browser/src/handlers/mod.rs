pub mod dialogs;
pub mod emulation;
pub mod input;
pub mod inspect;
pub mod lifecycle;
pub mod navigation;
pub mod state;
pub mod trace;

use crate::BrowserError;
use crate::Result;
use crate::registry::SessionRegistry;
use crate::session::Session;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use tracing::warn;

/// Route a request to its handler and wrap the outcome in the success/error
/// envelope. No error crosses this boundary unconverted; callers see the
/// classified message and taxonomy code, never raw frames or panics.
pub async fn dispatch(registry: &SessionRegistry, op: &str, params: Value) -> Value {
    debug!("dispatching {op}");
    match route(registry, op, params).await {
        Ok(data) => json!({ "success": true, "data": data }),
        Err(e) => {
            warn!("{op} failed: {e}");
            json!({ "success": false, "error": e.to_string(), "code": e.code() })
        }
    }
}

async fn route(registry: &SessionRegistry, op: &str, params: Value) -> Result<Value> {
    match op {
        // lifecycle
        "launch" => lifecycle::launch(registry, params).await,
        "list" => lifecycle::list(registry).await,
        "close" => lifecycle::close(registry, params).await,

        // navigation
        "navigate" => navigation::navigate(registry, params).await,
        "back" => navigation::back(registry, params).await,
        "forward" => navigation::forward(registry, params).await,
        "reload" => navigation::reload(registry, params).await,
        "wait" => navigation::wait(registry, params).await,

        // input
        "click" => input::click(registry, params).await,
        "type" => input::type_text(registry, params).await,
        "hover" => input::hover(registry, params).await,
        "scroll" => input::scroll(registry, params).await,
        "pressKey" => input::press_key(registry, params).await,
        "selectOption" => input::select_option(registry, params).await,
        "drag" => input::drag(registry, params).await,
        "fillForm" => input::fill_form(registry, params).await,
        "upload" => input::upload(registry, params).await,

        // inspection
        "snapshot" => inspect::snapshot(registry, params).await,
        "extract" => inspect::extract(registry, params).await,
        "execute" => inspect::execute(registry, params).await,
        "screenshot" => inspect::screenshot(registry, params).await,
        "pdf" => inspect::pdf(registry, params).await,
        "console" => inspect::console(registry, params).await,
        "errors" => inspect::errors(registry, params).await,
        "network" => inspect::network(registry, params).await,
        "response" => inspect::response(registry, params).await,

        // dialogs and downloads
        "dialog" => dialogs::dialog(registry, params).await,
        "download" => dialogs::download(registry, params).await,

        // cookies and storage
        "cookiesGet" => state::cookies_get(registry, params).await,
        "cookiesSet" => state::cookies_set(registry, params).await,
        "cookiesClear" => state::cookies_clear(registry, params).await,
        "storageGet" => state::storage_get(registry, params).await,
        "storageSet" => state::storage_set(registry, params).await,
        "storageClear" => state::storage_clear(registry, params).await,

        // emulation
        "emulateDevice" => emulation::emulate_device(registry, params).await,
        "geolocation" => emulation::geolocation(registry, params).await,
        "timezone" => emulation::timezone(registry, params).await,
        "locale" => emulation::locale(registry, params).await,
        "offline" => emulation::offline(registry, params).await,
        "headers" => emulation::headers(registry, params).await,

        // tracing and raw protocol access
        "traceStart" => trace::trace_start(registry, params).await,
        "traceStop" => trace::trace_stop(registry, params).await,
        "cdp" => trace::cdp_passthrough(registry, params).await,

        other => Err(BrowserError::InvalidRequest(format!(
            "unknown operation: {other}"
        ))),
    }
}

/// Deserialize a request body, mapping serde failures to invalid-input.
pub(crate) fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| BrowserError::InvalidRequest(format!("malformed request body: {e}")))
}

/// Look up the session named by the request body.
pub(crate) async fn session_from(
    registry: &SessionRegistry,
    params: &Value,
) -> Result<Arc<Session>> {
    let session_id = params
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| BrowserError::InvalidRequest("sessionId is required".to_string()))?;
    registry.get(session_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn unknown_operation_yields_invalid_input_envelope() {
        let registry = SessionRegistry::new();
        let envelope = dispatch(&registry, "frobnicate", json!({})).await;
        assert_eq!(envelope["success"], json!(false));
        assert_eq!(envelope["code"], json!("invalid_input"));
    }

    #[tokio::test]
    async fn missing_session_yields_not_found_envelope() {
        let registry = SessionRegistry::new();
        let envelope = dispatch(&registry, "console", json!({"sessionId": "s-1"})).await;
        assert_eq!(envelope["success"], json!(false));
        assert_eq!(envelope["code"], json!("not_found"));
        assert!(envelope["error"].as_str().unwrap().contains("s-1"));
    }

    #[tokio::test]
    async fn close_twice_is_one_not_found_not_a_crash() {
        let registry = SessionRegistry::new();
        // No session was ever registered under this id; close must surface a
        // clean client error both times.
        let first = dispatch(&registry, "close", json!({"sessionId": "gone"})).await;
        let second = dispatch(&registry, "close", json!({"sessionId": "gone"})).await;
        assert_eq!(first["code"], json!("not_found"));
        assert_eq!(second["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn missing_session_id_is_invalid_input() {
        let registry = SessionRegistry::new();
        let envelope = dispatch(&registry, "navigate", json!({"url": "https://example.com"})).await;
        assert_eq!(envelope["code"], json!("invalid_input"));
    }
}
