use crate::BrowserError;
use crate::Result;
use crate::handlers::parse;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::snapshot;
use crate::snapshot::ElementHandle;
use crate::snapshot::Target;
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

/// A ref (preferred) or a raw structural selector. Exactly one must be
/// provided; the ref field must actually be ref-shaped.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetParam {
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
}

impl TargetParam {
    fn is_empty(&self) -> bool {
        self.reference.is_none() && self.selector.is_none()
    }
}

pub(crate) async fn resolve_target(
    session: &Session,
    target: &TargetParam,
) -> Result<ElementHandle> {
    match (&target.reference, &target.selector) {
        (Some(_), Some(_)) => Err(BrowserError::InvalidRequest(
            "provide either ref or selector, not both".to_string(),
        )),
        (Some(reference), None) => match Target::parse(reference) {
            Target::Ref(_) => snapshot::resolve(session, reference).await,
            Target::Selector(_) => Err(BrowserError::InvalidRequest(format!(
                "{reference} is not a ref (expected e1, @e1 or ref=e1)"
            ))),
        },
        (None, Some(selector)) => snapshot::resolve(session, selector).await,
        (None, None) => Err(BrowserError::InvalidRequest(
            "target required: provide ref or selector".to_string(),
        )),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClickParams {
    session_id: String,
    #[serde(flatten)]
    target: TargetParam,
}

pub async fn click(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: ClickParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let handle = resolve_target(&session, &body.target).await?;
    let (x, y) = snapshot::element_center(session.page(), &handle).await?;
    session.page().click(x, y).await?;
    Ok(json!({ "clicked": true, "x": x, "y": y }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeParams {
    session_id: String,
    #[serde(flatten)]
    target: TargetParam,
    text: String,
    #[serde(default)]
    submit: bool,
}

pub async fn type_text(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: TypeParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    // Without a target we type into whatever currently has focus.
    if !body.target.is_empty() {
        let handle = resolve_target(&session, &body.target).await?;
        snapshot::call_on_element(session.page(), &handle, "function() { this.focus(); }")
            .await?;
    }
    session.page().type_text(&body.text).await?;
    if body.submit {
        session.page().press_key("Enter").await?;
    }
    Ok(json!({ "typed": body.text.chars().count(), "submitted": body.submit }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HoverParams {
    session_id: String,
    #[serde(flatten)]
    target: TargetParam,
}

pub async fn hover(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: HoverParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let handle = resolve_target(&session, &body.target).await?;
    let (x, y) = snapshot::element_center(session.page(), &handle).await?;
    session.page().move_mouse(x, y).await?;
    Ok(json!({ "hovered": true, "x": x, "y": y }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrollParams {
    session_id: String,
    #[serde(flatten)]
    target: TargetParam,
    #[serde(default)]
    dx: f64,
    #[serde(default)]
    dy: f64,
}

pub async fn scroll(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: ScrollParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    if body.target.is_empty() {
        let position = session.page().scroll_by(body.dx, body.dy).await?;
        Ok(json!({ "scrolled": true, "position": position }))
    } else {
        let handle = resolve_target(&session, &body.target).await?;
        snapshot::call_on_element(
            session.page(),
            &handle,
            "function() { this.scrollIntoView({ block: 'center' }); }",
        )
        .await?;
        Ok(json!({ "scrolled": true }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PressKeyParams {
    session_id: String,
    key: String,
}

pub async fn press_key(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: PressKeyParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    session.page().press_key(&body.key).await?;
    Ok(json!({ "pressed": body.key }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectOptionParams {
    session_id: String,
    #[serde(flatten)]
    target: TargetParam,
    values: Vec<String>,
}

pub async fn select_option(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: SelectOptionParams = parse(params)?;
    if body.values.is_empty() {
        return Err(BrowserError::InvalidRequest(
            "values must not be empty".to_string(),
        ));
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let handle = resolve_target(&session, &body.target).await?;
    let script = format!(
        r#"function() {{
  const values = {values};
  if (this.tagName !== 'SELECT') throw new Error('not a <select> element');
  let matched = 0;
  for (const option of this.options) {{
    const hit = values.includes(option.value) || values.includes(option.label);
    option.selected = hit && (this.multiple || matched === 0);
    if (hit) matched++;
  }}
  this.dispatchEvent(new Event('input', {{ bubbles: true }}));
  this.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return matched;
}}"#,
        values = serde_json::to_string(&body.values)?
    );
    let matched = snapshot::call_on_element(session.page(), &handle, &script).await?;
    if matched.as_u64() == Some(0) {
        return Err(BrowserError::ElementNotFound(format!(
            "no option matched {:?}",
            body.values
        )));
    }
    Ok(json!({ "selected": matched }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DragParams {
    session_id: String,
    from: TargetParam,
    to: TargetParam,
}

pub async fn drag(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: DragParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let from_handle = resolve_target(&session, &body.from).await?;
    let to_handle = resolve_target(&session, &body.to).await?;
    let from = snapshot::element_center(session.page(), &from_handle).await?;
    let to = snapshot::element_center(session.page(), &to_handle).await?;
    session.page().drag(from, to).await?;
    Ok(json!({ "dragged": true, "from": { "x": from.0, "y": from.1 }, "to": { "x": to.0, "y": to.1 } }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillFormParams {
    session_id: String,
    fields: Vec<FillField>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillField {
    #[serde(flatten)]
    target: TargetParam,
    value: Value,
}

pub async fn fill_form(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: FillFormParams = parse(params)?;
    if body.fields.is_empty() {
        return Err(BrowserError::InvalidRequest(
            "fields must not be empty".to_string(),
        ));
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let mut filled = 0usize;
    for field in &body.fields {
        let handle = resolve_target(&session, &field.target).await?;
        let script = format!(
            r#"function() {{
  const value = {value};
  const tag = this.tagName;
  if (tag === 'INPUT' && (this.type === 'checkbox' || this.type === 'radio')) {{
    this.checked = value === true || value === 'true';
  }} else if (tag === 'SELECT') {{
    this.value = String(value);
  }} else if (tag === 'INPUT' || tag === 'TEXTAREA') {{
    const proto = tag === 'INPUT' ? HTMLInputElement.prototype : HTMLTextAreaElement.prototype;
    Object.getOwnPropertyDescriptor(proto, 'value').set.call(this, String(value));
  }} else if (this.isContentEditable) {{
    this.textContent = String(value);
  }} else {{
    throw new Error('not a fillable element');
  }}
  this.dispatchEvent(new Event('input', {{ bubbles: true }}));
  this.dispatchEvent(new Event('change', {{ bubbles: true }}));
}}"#,
            value = serde_json::to_string(&field.value)?
        );
        snapshot::call_on_element(session.page(), &handle, &script).await?;
        filled += 1;
    }
    Ok(json!({ "filled": filled }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadParams {
    session_id: String,
    #[serde(flatten)]
    target: TargetParam,
    paths: Vec<String>,
}

pub async fn upload(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: UploadParams = parse(params)?;
    if body.paths.is_empty() {
        return Err(BrowserError::InvalidRequest(
            "paths must not be empty".to_string(),
        ));
    }
    for path in &body.paths {
        if !std::path::Path::new(path).is_file() {
            return Err(BrowserError::InvalidRequest(format!(
                "upload file does not exist: {path}"
            )));
        }
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let handle = resolve_target(&session, &body.target).await?;
    let params = SetFileInputFilesParams::builder()
        .files(body.paths.clone())
        .object_id(handle.object_id.clone())
        .build()
        .map_err(BrowserError::CdpError)?;
    session.page().cdp().execute(params).await?;
    Ok(json!({ "uploaded": body.paths.len() }))
}
