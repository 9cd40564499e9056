use crate::BrowserError;
use crate::Result;
use crate::page::Page;
use crate::session::Session;
use chromiumoxide::cdp::browser_protocol::accessibility::AxNode;
use chromiumoxide::cdp::browser_protocol::accessibility::AxPropertyName;
use chromiumoxide::cdp::browser_protocol::accessibility::GetFullAxTreeParams;
use chromiumoxide::cdp::browser_protocol::dom::BackendNodeId;
use chromiumoxide::cdp::browser_protocol::dom::GetBoxModelParams;
use chromiumoxide::cdp::browser_protocol::dom::ResolveNodeParams;
use chromiumoxide::cdp::js_protocol::runtime::CallFunctionOnParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::cdp::js_protocol::runtime::RemoteObjectId;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

/// Snapshot-scoped element identity: role + accessible name, with an index
/// disambiguating duplicates. Valid only against the map produced by the
/// snapshot that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub role: String,
    pub name: String,
    pub nth: usize,
}

/// What a target string turned out to be. Keeping this a tagged variant makes
/// resolution exhaustive: a ref-shaped token can never silently fall through
/// to selector interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ref(String),
    Selector(String),
}

static REF_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:@|ref=)?(e\d+)$").unwrap()
});

impl Target {
    /// Recognized ref spellings: `e1`, `@e1`, `ref=e1`. Anything else is a
    /// raw structural selector.
    pub fn parse(input: &str) -> Target {
        let trimmed = input.trim();
        match REF_SYNTAX.captures(trimmed) {
            Some(caps) => Target::Ref(caps[1].to_string()),
            None => Target::Selector(trimmed.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Only actionable elements get refs.
    #[default]
    Interactive,
    /// Every named node gets a ref.
    Full,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResult {
    pub text: String,
    pub ref_count: usize,
}

/// A resolved live element, addressable by either CDP identity.
#[derive(Debug, Clone)]
pub struct ElementHandle {
    pub object_id: RemoteObjectId,
    pub backend_node_id: Option<BackendNodeId>,
}

/// Roles that accept interaction and therefore always earn a ref in
/// interactive mode.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "checkbox",
    "combobox",
    "link",
    "listbox",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "radio",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
    "tab",
    "textbox",
];

/// Roles that are pure noise in a structural snapshot.
const SKIP_ROLES: &[&str] = &["InlineTextBox", "LineBreak", "none", "presentation"];

/// Flattened view of one accessibility node, decoupled from the protocol
/// types so the walk logic stays unit-testable.
#[derive(Debug, Clone)]
pub struct SnapNode {
    pub role: String,
    pub name: String,
    pub depth: usize,
    pub focusable: bool,
    pub backend_node_id: Option<BackendNodeId>,
}

/// Walk the page's accessibility tree, assign refs, and replace the session's
/// ref map wholesale.
pub async fn capture(session: &Session, mode: SnapshotMode) -> Result<SnapshotResult> {
    let resp = session
        .page()
        .cdp()
        .execute(GetFullAxTreeParams::builder().build())
        .await?;

    let nodes = flatten_tree(&resp.result.nodes);
    let (text, refs) = render(&nodes, mode);
    let ref_count = refs.len();
    debug!("snapshot assigned {ref_count} refs over {} nodes", nodes.len());

    session.replace_refs(refs).await;
    Ok(SnapshotResult { text, ref_count })
}

/// Resolve a ref or selector into a live element handle.
///
/// A ref-shaped token absent from the current map fails with `UnknownRef`;
/// it must never be reinterpreted as a selector, which could silently resolve
/// to the wrong element. A present token is re-located in the live tree by
/// role + name + nth, so a mutated page fails loudly instead of acting on
/// stale geometry.
pub async fn resolve(session: &Session, input: &str) -> Result<ElementHandle> {
    match Target::parse(input) {
        Target::Ref(token) => {
            let role_ref = session
                .lookup_ref(&token)
                .await
                .ok_or_else(|| BrowserError::UnknownRef(token.clone()))?;
            resolve_role_ref(session, &token, &role_ref).await
        }
        Target::Selector(selector) => resolve_selector(session.page(), &selector).await,
    }
}

async fn resolve_role_ref(
    session: &Session,
    token: &str,
    role_ref: &RoleRef,
) -> Result<ElementHandle> {
    let resp = session
        .page()
        .cdp()
        .execute(GetFullAxTreeParams::builder().build())
        .await?;

    let backend_node_id = resp
        .result
        .nodes
        .iter()
        .filter(|node| {
            !node.ignored
                && node_role(node) == role_ref.role
                && node_name(node) == role_ref.name
        })
        .nth(role_ref.nth)
        .and_then(|node| node.backend_dom_node_id)
        .ok_or_else(|| {
            BrowserError::ElementNotFound(format!(
                "{token} ({} \"{}\") no longer present; take a new snapshot",
                role_ref.role, role_ref.name
            ))
        })?;

    let resolved = session
        .page()
        .cdp()
        .execute(
            ResolveNodeParams::builder()
                .backend_node_id(backend_node_id)
                .build(),
        )
        .await?;
    let object_id = resolved
        .result
        .object
        .object_id
        .clone()
        .ok_or_else(|| BrowserError::ElementNotFound(format!("{token} has no remote object")))?;

    Ok(ElementHandle {
        object_id,
        backend_node_id: Some(backend_node_id),
    })
}

async fn resolve_selector(page: &Page, selector: &str) -> Result<ElementHandle> {
    let expression = format!(
        "document.querySelector({})",
        serde_json::to_string(selector)?
    );
    let params = EvaluateParams::builder()
        .expression(expression)
        .build()
        .map_err(BrowserError::CdpError)?;
    let resp = page.cdp().execute(params).await?;

    let object_id = resp
        .result
        .result
        .object_id
        .clone()
        .ok_or_else(|| BrowserError::ElementNotFound(format!("no element matches {selector}")))?;

    Ok(ElementHandle {
        object_id,
        backend_node_id: None,
    })
}

/// Viewport center of the element's box model content quad.
pub async fn element_center(page: &Page, handle: &ElementHandle) -> Result<(f64, f64)> {
    // Bring it into view first so the quad is on-screen for input dispatch.
    let _ = call_on_element(
        page,
        handle,
        "function() { this.scrollIntoView({ block: 'center', inline: 'center' }); }",
    )
    .await;

    let mut builder = GetBoxModelParams::builder();
    builder = match handle.backend_node_id {
        Some(id) => builder.backend_node_id(id),
        None => builder.object_id(handle.object_id.clone()),
    };
    let resp = page
        .cdp()
        .execute(builder.build())
        .await
        .map_err(|_| BrowserError::ElementNotFound("element has no box model".to_string()))?;

    let quad = resp.result.model.content.inner().clone();
    if quad.len() < 8 {
        return Err(BrowserError::ElementNotFound(
            "element box model is degenerate".to_string(),
        ));
    }
    let x = (quad[0] + quad[2] + quad[4] + quad[6]) / 4.0;
    let y = (quad[1] + quad[3] + quad[5] + quad[7]) / 4.0;
    Ok((x, y))
}

/// Run a function with the element bound as `this`, returning its value.
pub async fn call_on_element(
    page: &Page,
    handle: &ElementHandle,
    function_declaration: &str,
) -> Result<Value> {
    let params = CallFunctionOnParams::builder()
        .function_declaration(function_declaration)
        .object_id(handle.object_id.clone())
        .return_by_value(true)
        .await_promise(true)
        .build()
        .map_err(BrowserError::CdpError)?;
    let resp = page.cdp().execute(params).await?;

    if let Some(details) = &resp.result.exception_details {
        return Err(BrowserError::CdpError(format!(
            "element script threw: {}",
            details.text
        )));
    }
    Ok(resp.result.result.value.clone().unwrap_or(Value::Null))
}

// ---- pure walk/render layer -------------------------------------------

fn node_role(node: &AxNode) -> String {
    node.role
        .as_ref()
        .and_then(|r| r.value.as_ref())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn node_name(node: &AxNode) -> String {
    node.name
        .as_ref()
        .and_then(|n| n.value.as_ref())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn node_focusable(node: &AxNode) -> bool {
    node.properties.as_ref().is_some_and(|props| {
        props.iter().any(|p| {
            matches!(p.name, AxPropertyName::Focusable)
                && p.value
                    .value
                    .as_ref()
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
        })
    })
}

/// Project protocol nodes into the plain shape the render layer consumes.
/// Depth comes from parent links; skipped roles pass their children through.
fn flatten_tree(nodes: &[AxNode]) -> Vec<SnapNode> {
    let mut depths: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();

    for node in nodes {
        let id = node.node_id.inner().to_string();
        let parent_depth = node
            .parent_id
            .as_ref()
            .and_then(|p| depths.get(p.inner().as_str()).copied())
            .unwrap_or(0);

        let role = node_role(node);
        if node.ignored || SKIP_ROLES.contains(&role.as_str()) {
            depths.insert(id, parent_depth);
            continue;
        }

        let name = node_name(node);
        let focusable = node_focusable(node);

        // Anonymous structural containers add depth but no line of output.
        let interesting = !name.is_empty() || focusable || INTERACTIVE_ROLES.contains(&role.as_str());
        if interesting {
            out.push(SnapNode {
                role,
                name,
                depth: parent_depth,
                focusable,
                backend_node_id: node.backend_dom_node_id,
            });
            depths.insert(id, parent_depth + 1);
        } else {
            depths.insert(id, parent_depth);
        }
    }

    out
}

/// Assign refs and produce the indented structural text. Later duplicates of
/// the same role+name carry an increasing nth.
pub fn render(nodes: &[SnapNode], mode: SnapshotMode) -> (String, HashMap<String, RoleRef>) {
    let mut refs = HashMap::new();
    let mut duplicates: HashMap<(String, String), usize> = HashMap::new();
    let mut text = String::new();
    let mut next_ref = 1usize;

    for node in nodes {
        let gets_ref = match mode {
            SnapshotMode::Interactive => {
                INTERACTIVE_ROLES.contains(&node.role.as_str())
                    || (node.focusable && !node.name.is_empty())
            }
            SnapshotMode::Full => !node.name.is_empty() || node.focusable,
        };

        let indent = "  ".repeat(node.depth);
        let mut line = format!("{indent}{}", node.role);
        if !node.name.is_empty() {
            let display: String = node.name.chars().take(200).collect();
            line.push_str(&format!(" \"{}\"", display.replace('"', "\\\"")));
        }

        if gets_ref {
            let key = (node.role.clone(), node.name.clone());
            let nth = *duplicates
                .entry(key)
                .and_modify(|n| *n += 1)
                .or_insert(0);
            let token = format!("e{next_ref}");
            next_ref += 1;
            line.push_str(&format!(" [ref={token}]"));
            refs.insert(
                token,
                RoleRef {
                    role: node.role.clone(),
                    name: node.name.clone(),
                    nth,
                },
            );
        }

        text.push_str(&line);
        text.push('\n');
    }

    (text, refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(role: &str, name: &str, depth: usize, focusable: bool) -> SnapNode {
        SnapNode {
            role: role.to_string(),
            name: name.to_string(),
            depth,
            focusable,
            backend_node_id: None,
        }
    }

    #[test]
    fn ref_syntax_is_recognized_in_all_three_spellings() {
        assert_eq!(Target::parse("e1"), Target::Ref("e1".to_string()));
        assert_eq!(Target::parse("@e12"), Target::Ref("e12".to_string()));
        assert_eq!(Target::parse("ref=e3"), Target::Ref("e3".to_string()));
    }

    #[test]
    fn non_ref_strings_fall_back_to_selectors() {
        assert_eq!(
            Target::parse("#submit"),
            Target::Selector("#submit".to_string())
        );
        assert_eq!(
            Target::parse("button.primary"),
            Target::Selector("button.primary".to_string())
        );
        // Ref-ish but not the exact shape.
        assert_eq!(Target::parse("e1x"), Target::Selector("e1x".to_string()));
        assert_eq!(Target::parse("ref="), Target::Selector("ref=".to_string()));
    }

    #[test]
    fn duplicate_role_name_pairs_get_increasing_nth() {
        let nodes = vec![
            node("button", "Save", 0, true),
            node("button", "Save", 0, true),
            node("button", "Cancel", 0, true),
            node("button", "Save", 0, true),
        ];
        let (_, refs) = render(&nodes, SnapshotMode::Interactive);

        assert_eq!(refs["e1"], RoleRef { role: "button".into(), name: "Save".into(), nth: 0 });
        assert_eq!(refs["e2"], RoleRef { role: "button".into(), name: "Save".into(), nth: 1 });
        assert_eq!(refs["e3"], RoleRef { role: "button".into(), name: "Cancel".into(), nth: 0 });
        assert_eq!(refs["e4"], RoleRef { role: "button".into(), name: "Save".into(), nth: 2 });
    }

    #[test]
    fn interactive_mode_skips_plain_text_nodes() {
        let nodes = vec![
            node("StaticText", "hello", 1, false),
            node("link", "Docs", 1, true),
        ];
        let (text, refs) = render(&nodes, SnapshotMode::Interactive);
        assert_eq!(refs.len(), 1);
        assert!(text.contains("link \"Docs\" [ref=e1]"));
        assert!(text.contains("StaticText \"hello\"\n"));
    }

    #[test]
    fn full_mode_assigns_refs_to_every_named_node() {
        let nodes = vec![
            node("heading", "Title", 0, false),
            node("StaticText", "body", 1, false),
        ];
        let (_, refs) = render(&nodes, SnapshotMode::Full);
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn new_snapshot_replaces_rather_than_merges() {
        // The staleness guarantee reduces to: refs live in whichever map the
        // latest render produced, and lookups go through that map only.
        let (_, first) = render(&[node("button", "Old", 0, true)], SnapshotMode::Interactive);
        assert!(first.contains_key("e1"));

        let (_, second) = render(
            &[
                node("link", "New A", 0, true),
                node("link", "New B", 0, true),
            ],
            SnapshotMode::Interactive,
        );
        assert_eq!(second.len(), 2);
        assert_eq!(second["e1"].role, "link");
        // "e3" existed in no snapshot; a lookup must miss, not fall through.
        assert!(!second.contains_key("e3"));
    }
}
