use crate::BrowserError;
use crate::Result;
use crate::config::LaunchOptions;
use crate::executable::BrowserExecutable;
use crate::readiness::poll_until;
use chrono::DateTime;
use chrono::Utc;
use rand::Rng;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Deadline for the debug HTTP endpoint to start answering after spawn.
const READY_DEADLINE: Duration = Duration::from_secs(15);
const READY_INTERVAL: Duration = Duration::from_millis(250);
/// Per-probe HTTP timeout while polling readiness.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// Deadline for a fresh profile to finish first-run initialization.
const BOOTSTRAP_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for the bootstrap process to exit after termination.
const BOOTSTRAP_EXIT_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for graceful shutdown before escalating to a hard kill.
const STOP_DEADLINE: Duration = Duration::from_millis(2500);
const STOP_INTERVAL: Duration = Duration::from_millis(100);

const PORT_RANGE_START: u16 = 9222;
const PORT_RANGE_LEN: u16 = 100;

/// A browser process this launcher spawned and owns until the session takes
/// it over. `stop` is idempotent; dropping the child also kills it.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: u32,
    pub executable: BrowserExecutable,
    pub user_data_dir: PathBuf,
    pub debug_port: u16,
    pub ws_endpoint: String,
    pub started_at: DateTime<Utc>,
    child: Option<Child>,
}

impl LaunchedProcess {
    /// Stop the process: graceful signal first, then poll for exit, then a
    /// hard kill. Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("stopping browser process {}", self.pid);

        terminate(&child);

        let exited = poll_until("browser exit", STOP_DEADLINE, STOP_INTERVAL, || {
            let done = matches!(child.try_wait(), Ok(Some(_)));
            async move { done.then_some(()) }
        })
        .await
        .is_ok();

        if !exited {
            warn!("browser process {} ignored termination, killing", self.pid);
            if let Err(e) = child.kill().await {
                warn!("failed to kill browser process {}: {e}", self.pid);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.child.is_none()
    }
}

/// Launch a native browser with a debugging port and a persistent profile,
/// and hand back the discovered browser-level WebSocket endpoint. Any failure
/// after the spawn kills the child before the error is returned.
pub async fn launch(
    options: &LaunchOptions,
    executable: BrowserExecutable,
) -> Result<LaunchedProcess> {
    let user_data_dir = profile_dir(options.profile.as_deref())?;
    tokio::fs::create_dir_all(&user_data_dir).await?;

    if !profile_is_initialized(&user_data_dir) {
        bootstrap_profile(&executable, &user_data_dir, options).await?;
    }

    let debug_port = match options.port {
        Some(port) => port,
        None => pick_debug_port()?,
    };

    let mut command = Command::new(&executable.path);
    command
        .arg(format!("--remote-debugging-port={debug_port}"))
        .arg(format!("--user-data-dir={}", user_data_dir.display()))
        .args(common_flags(options))
        .arg(format!(
            "--window-size={},{}",
            options.viewport.width, options.viewport.height
        ))
        // Always open a blank target so one inspectable page exists from the start.
        .arg("about:blank")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if options.headless {
        command.arg("--headless=new");
    }
    if options.no_sandbox {
        command.arg("--no-sandbox");
    }

    info!(
        "launching {} on debug port {debug_port} with profile {}",
        executable.path.display(),
        user_data_dir.display()
    );
    let child = command
        .spawn()
        .map_err(|e| BrowserError::LaunchFailed(format!("spawn failed: {e}")))?;
    let pid = child.id().unwrap_or_default();

    let mut process = LaunchedProcess {
        pid,
        executable,
        user_data_dir,
        debug_port,
        ws_endpoint: String::new(),
        started_at: Utc::now(),
        child: Some(child),
    };

    match discover_ws_endpoint(debug_port).await {
        Ok(ws) => {
            process.ws_endpoint = ws;
            Ok(process)
        }
        Err(e) => {
            // Partial launches must not leak processes.
            process.stop().await;
            Err(BrowserError::LaunchFailed(format!(
                "browser spawned but debug endpoint never became ready: {e}"
            )))
        }
    }
}

/// Poll the debug HTTP endpoint until it answers, then read and normalize the
/// browser-level WebSocket endpoint from `/json/version`.
async fn discover_ws_endpoint(port: u16) -> Result<String> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| BrowserError::CdpError(e.to_string()))?;
    let version_url = format!("http://127.0.0.1:{port}/json/version");

    let body = poll_until("CDP readiness", READY_DEADLINE, READY_INTERVAL, || {
        let client = client.clone();
        let url = version_url.clone();
        async move {
            let resp = client.get(&url).send().await.ok()?;
            if !resp.status().is_success() {
                return None;
            }
            resp.json::<serde_json::Value>().await.ok()
        }
    })
    .await?;

    let ws = body
        .get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            BrowserError::CdpError("no webSocketDebuggerUrl in /json/version".to_string())
        })?;

    normalize_ws_endpoint(ws)
}

/// Browsers may advertise a wildcard bind address that is not dialable as-is;
/// rewrite the host to loopback.
fn normalize_ws_endpoint(ws: &str) -> Result<String> {
    let mut url = url::Url::parse(ws)
        .map_err(|e| BrowserError::CdpError(format!("bad WebSocket endpoint {ws}: {e}")))?;
    match url.host_str() {
        Some("0.0.0.0") | Some("[::]") | Some("::") | None => {
            url.set_host(Some("127.0.0.1"))
                .map_err(|e| BrowserError::CdpError(format!("cannot rewrite host: {e}")))?;
        }
        _ => {}
    }
    Ok(url.to_string())
}

/// A brand-new profile needs the browser's own first-run initialization
/// before a debugging session can attach cleanly: spawn once without a debug
/// port, wait for the marker files, then shut it down.
async fn bootstrap_profile(
    executable: &BrowserExecutable,
    user_data_dir: &Path,
    options: &LaunchOptions,
) -> Result<()> {
    info!("bootstrapping fresh profile at {}", user_data_dir.display());

    let mut command = Command::new(&executable.path);
    command
        .arg(format!("--user-data-dir={}", user_data_dir.display()))
        .args(common_flags(options))
        .arg("about:blank")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if options.headless {
        command.arg("--headless=new");
    }
    if options.no_sandbox {
        command.arg("--no-sandbox");
    }

    let mut child = command
        .spawn()
        .map_err(|e| BrowserError::LaunchFailed(format!("bootstrap spawn failed: {e}")))?;

    let ready = poll_until(
        "profile bootstrap",
        BOOTSTRAP_DEADLINE,
        Duration::from_millis(200),
        || {
            let initialized = profile_is_initialized(user_data_dir);
            async move { initialized.then_some(()) }
        },
    )
    .await;

    terminate(&child);
    let exited = poll_until(
        "bootstrap exit",
        BOOTSTRAP_EXIT_DEADLINE,
        STOP_INTERVAL,
        || {
            let done = matches!(child.try_wait(), Ok(Some(_)));
            async move { done.then_some(()) }
        },
    )
    .await
    .is_ok();
    if !exited {
        let _ = child.kill().await;
    }

    match ready {
        Ok(()) => Ok(()),
        Err(e) => Err(BrowserError::LaunchFailed(format!(
            "profile never initialized: {e}"
        ))),
    }
}

/// First-run initialization is detected by the presence of both marker files
/// the browser writes into a usable profile.
fn profile_is_initialized(user_data_dir: &Path) -> bool {
    user_data_dir.join("Default").join("Preferences").is_file()
        && user_data_dir.join("Local State").is_file()
}

fn profile_dir(profile: Option<&str>) -> Result<PathBuf> {
    let root = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".skipper")
        .join("profiles");
    let name = profile.unwrap_or("default");
    if name.contains(['/', '\\']) || name == ".." {
        return Err(BrowserError::InvalidRequest(format!(
            "invalid profile name: {name}"
        )));
    }
    Ok(root.join(name))
}

/// Probe the bounded port range, starting at a random offset so concurrent
/// launches don't contend on the same head of the range.
fn pick_debug_port() -> Result<u16> {
    let offset: u16 = rand::thread_rng().gen_range(0..PORT_RANGE_LEN);
    for i in 0..PORT_RANGE_LEN {
        let port = PORT_RANGE_START + ((offset + i) % PORT_RANGE_LEN);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
        debug!("debug port {port} is busy");
    }
    Err(BrowserError::LaunchFailed(format!(
        "no free debug port in {PORT_RANGE_START}..{}",
        PORT_RANGE_START + PORT_RANGE_LEN
    )))
}

/// Flags that suppress first-run UI, sync and crash-restore prompts. Any of
/// those would block automation since no human is present to dismiss them.
fn common_flags(_options: &LaunchOptions) -> Vec<String> {
    [
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-sync",
        "--disable-session-crashed-bubble",
        "--hide-crash-restore-bubble",
        "--disable-features=ChromeWhatsNewUI,TriggerFirstRunUI",
        "--disable-background-networking",
        "--disable-hang-monitor",
        "--disable-blink-features=AutomationControlled",
        "--remote-allow-origins=*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SIGTERM so the browser can flush its profile; SIGKILL comes later
        // if it lingers.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        debug!("no graceful termination on this platform for pid {pid}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wildcard_ws_hosts_are_rewritten_to_loopback() {
        assert_eq!(
            normalize_ws_endpoint("ws://0.0.0.0:9222/devtools/browser/abc").unwrap(),
            "ws://127.0.0.1:9222/devtools/browser/abc"
        );
        assert_eq!(
            normalize_ws_endpoint("ws://127.0.0.1:9222/devtools/browser/abc").unwrap(),
            "ws://127.0.0.1:9222/devtools/browser/abc"
        );
    }

    #[test]
    fn malformed_ws_endpoint_is_an_error() {
        assert!(normalize_ws_endpoint("not a url").is_err());
    }

    #[test]
    fn profile_markers_gate_initialization() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!profile_is_initialized(dir.path()));

        std::fs::create_dir_all(dir.path().join("Default")).unwrap();
        std::fs::write(dir.path().join("Default").join("Preferences"), b"{}").unwrap();
        assert!(!profile_is_initialized(dir.path()));

        std::fs::write(dir.path().join("Local State"), b"{}").unwrap();
        assert!(profile_is_initialized(dir.path()));
    }

    #[test]
    fn profile_names_cannot_escape_the_root() {
        assert!(profile_dir(Some("../etc")).is_err());
        assert!(profile_dir(Some("work")).unwrap().ends_with("profiles/work"));
        assert!(profile_dir(None).unwrap().ends_with("profiles/default"));
    }

    #[test]
    fn picked_port_is_bindable() {
        let port = pick_debug_port().unwrap();
        assert!((PORT_RANGE_START..PORT_RANGE_START + PORT_RANGE_LEN).contains(&port));
    }
}
