use crate::BrowserError;
use crate::Result;
use crate::handlers::parse;
use crate::handlers::session_from;
use crate::registry::SessionRegistry;
use chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::network::GetCookiesParams;
use chromiumoxide::cdp::browser_protocol::network::SetCookiesParams;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use std::collections::BTreeMap;

pub async fn cookies_get(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let session = session_from(registry, &params).await?;
    let _guard = session.lock_actions().await?;

    let resp = session
        .page()
        .cdp()
        .execute(GetCookiesParams::default())
        .await?;
    Ok(json!({ "cookies": serde_json::to_value(&resp.result.cookies)? }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CookiesSetParams {
    session_id: String,
    cookies: Value,
}

pub async fn cookies_set(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: CookiesSetParams = parse(params)?;
    let cookies: Vec<CookieParam> = serde_json::from_value(body.cookies)
        .map_err(|e| BrowserError::InvalidRequest(format!("malformed cookies: {e}")))?;
    if cookies.is_empty() {
        return Err(BrowserError::InvalidRequest(
            "cookies must not be empty".to_string(),
        ));
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let count = cookies.len();
    session
        .page()
        .cdp()
        .execute(SetCookiesParams { cookies })
        .await?;
    Ok(json!({ "set": count }))
}

pub async fn cookies_clear(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let session = session_from(registry, &params).await?;
    let _guard = session.lock_actions().await?;

    session
        .page()
        .cdp()
        .execute(ClearBrowserCookiesParams::default())
        .await?;
    Ok(json!({ "cleared": true }))
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum StorageScope {
    Local,
    Session,
}

impl StorageScope {
    fn object(self) -> &'static str {
        match self {
            Self::Local => "window.localStorage",
            Self::Session => "window.sessionStorage",
        }
    }
}

fn default_scope() -> StorageScope {
    StorageScope::Local
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageParams {
    session_id: String,
    #[serde(default = "default_scope")]
    scope: StorageScope,
}

pub async fn storage_get(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: StorageParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let script = format!(
        r#"(() => {{
  const store = {store};
  const out = {{}};
  for (let i = 0; i < store.length; i++) {{
    const key = store.key(i);
    out[key] = store.getItem(key);
  }}
  return out;
}})()"#,
        store = body.scope.object()
    );
    let entries = session.page().inject_js(&script).await?;
    Ok(json!({ "entries": entries }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageSetParams {
    session_id: String,
    #[serde(default = "default_scope")]
    scope: StorageScope,
    entries: BTreeMap<String, String>,
}

pub async fn storage_set(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: StorageSetParams = parse(params)?;
    if body.entries.is_empty() {
        return Err(BrowserError::InvalidRequest(
            "entries must not be empty".to_string(),
        ));
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let script = format!(
        r#"(() => {{
  const store = {store};
  const entries = {entries};
  for (const [key, value] of Object.entries(entries)) {{
    store.setItem(key, value);
  }}
  return Object.keys(entries).length;
}})()"#,
        store = body.scope.object(),
        entries = serde_json::to_string(&body.entries)?
    );
    let count = session.page().inject_js(&script).await?;
    Ok(json!({ "set": count }))
}

pub async fn storage_clear(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: StorageParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let script = format!("{}.clear()", body.scope.object());
    session.page().inject_js(&script).await?;
    Ok(json!({ "cleared": true }))
}
