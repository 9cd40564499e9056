use crate::BrowserError;
use crate::Result;
use crate::config::WaitStrategy;
use crate::handlers::parse;
use crate::handlers::session_from;
use crate::readiness::poll_until;
use crate::registry::SessionRegistry;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::time::Duration;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigateParams {
    session_id: String,
    url: String,
    #[serde(default)]
    wait: Option<WaitStrategy>,
}

pub async fn navigate(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: NavigateParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let result = session.page().goto(&body.url, body.wait).await?;
    Ok(serde_json::to_value(result)?)
}

pub async fn back(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let session = session_from(registry, &params).await?;
    let _guard = session.lock_actions().await?;
    session.page().go_back().await?;
    Ok(json!({ "url": session.page().current_url().await.ok() }))
}

pub async fn forward(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let session = session_from(registry, &params).await?;
    let _guard = session.lock_actions().await?;
    session.page().go_forward().await?;
    Ok(json!({ "url": session.page().current_url().await.ok() }))
}

pub async fn reload(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let session = session_from(registry, &params).await?;
    let _guard = session.lock_actions().await?;
    session.page().reload().await?;
    Ok(json!({ "url": session.page().current_url().await.ok() }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitParams {
    session_id: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    delay_ms: Option<u64>,
    #[serde(default = "default_wait_timeout_ms")]
    timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

/// Explicit wait: either for a selector to appear (bounded poll) or for a
/// fixed delay. One of the two must be given.
pub async fn wait(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: WaitParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    match (&body.selector, body.delay_ms) {
        (Some(selector), _) => {
            let probe_js = format!(
                "document.querySelector({}) !== null",
                serde_json::to_string(selector)?
            );
            let page = session.page();
            poll_until(
                &format!("wait for selector {selector}"),
                Duration::from_millis(body.timeout_ms),
                Duration::from_millis(100),
                || {
                    let probe_js = probe_js.clone();
                    async move {
                        match page.inject_js(&probe_js).await {
                            Ok(Value::Bool(true)) => Some(()),
                            _ => None,
                        }
                    }
                },
            )
            .await?;
            Ok(json!({ "found": selector }))
        }
        (None, Some(delay_ms)) => {
            // Bounded like every other wait; the cap doubles as input sanity.
            if delay_ms > 60_000 {
                return Err(BrowserError::InvalidRequest(
                    "delayMs must be at most 60000".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(json!({ "waitedMs": delay_ms }))
        }
        (None, None) => Err(BrowserError::InvalidRequest(
            "wait requires selector or delayMs".to_string(),
        )),
    }
}
