use crate::BrowserError;
use crate::Result;
use crate::handlers::input::TargetParam;
use crate::handlers::input::resolve_target;
use crate::handlers::parse;
use crate::registry::SessionRegistry;
use crate::snapshot;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::time::Duration;
use tokio::time::timeout;

#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum DialogAction {
    Accept,
    Dismiss,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DialogParams {
    session_id: String,
    action: DialogAction,
    #[serde(default)]
    prompt_text: Option<String>,
    #[serde(default = "default_dialog_timeout_ms")]
    timeout_ms: u64,
}

fn default_dialog_timeout_ms() -> u64 {
    30_000
}

/// Register intent for the next dialog and wait for it to fire. The action
/// lock is held only while installing the handler; the wait itself must not
/// serialize against the action that triggers the dialog.
pub async fn dialog(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: DialogParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;

    let (waiter_id, rx) = {
        let _guard = session.lock_actions().await?;
        session
            .install_dialog_handler(
                body.action == DialogAction::Accept,
                body.prompt_text.clone(),
            )
            .await
    };

    match timeout(Duration::from_millis(body.timeout_ms), rx).await {
        Ok(Ok(outcome)) => Ok(serde_json::to_value(outcome)?),
        // Sender dropped: the session closed underneath us, or a newer
        // handler displaced this one.
        Ok(Err(_)) => Err(BrowserError::SessionClosing),
        Err(_) => {
            // Clear the slot before surfacing the timeout so a later dialog
            // is auto-dismissed instead of consuming a dead handler.
            session.clear_dialog_handler(waiter_id).await;
            Err(BrowserError::Timeout(format!(
                "no dialog within {}ms",
                body.timeout_ms
            )))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadParams {
    session_id: String,
    /// Optional element to click to trigger the download.
    #[serde(flatten)]
    target: TargetParam,
    #[serde(default = "default_download_timeout_ms")]
    timeout_ms: u64,
}

fn default_download_timeout_ms() -> u64 {
    60_000
}

/// Queue a download waiter, optionally trigger it with a click, and wait for
/// the next download to begin. FIFO: the oldest waiter gets the next event
/// regardless of which action triggered it.
pub async fn download(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: DownloadParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;

    let (waiter_id, rx) = {
        let _guard = session.lock_actions().await?;
        let (waiter_id, rx) = session.push_download_waiter().await;

        let has_target = body.target.reference.is_some() || body.target.selector.is_some();
        if has_target {
            let click = async {
                let handle = resolve_target(&session, &body.target).await?;
                let (x, y) = snapshot::element_center(session.page(), &handle).await?;
                session.page().click(x, y).await
            };
            if let Err(e) = click.await {
                session.remove_download_waiter(waiter_id).await;
                return Err(e);
            }
        }
        (waiter_id, rx)
    };

    match timeout(Duration::from_millis(body.timeout_ms), rx).await {
        Ok(Ok(event)) => Ok(serde_json::to_value(event)?),
        Ok(Err(_)) => Err(BrowserError::SessionClosing),
        Err(_) => {
            session.remove_download_waiter(waiter_id).await;
            Err(BrowserError::Timeout(format!(
                "no download within {}ms",
                body.timeout_ms
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_defaults_apply() {
        let body: DialogParams = serde_json::from_value(json!({
            "sessionId": "s", "action": "accept"
        }))
        .unwrap();
        assert!(body.action == DialogAction::Accept);
        assert_eq!(body.timeout_ms, 30_000);
        assert!(body.prompt_text.is_none());
    }

    #[test]
    fn dialog_action_rejects_unknown_values() {
        let result: std::result::Result<DialogParams, _> = serde_json::from_value(json!({
            "sessionId": "s", "action": "maybe"
        }));
        assert!(result.is_err());
    }
}
