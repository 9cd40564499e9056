use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;

/// Browser family a resolved binary belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutableKind {
    Chrome,
    Chromium,
    Edge,
    Brave,
}

impl ExecutableKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Chromium => "chromium",
            Self::Edge => "edge",
            Self::Brave => "brave",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserExecutable {
    pub path: PathBuf,
    pub kind: ExecutableKind,
}

#[cfg(target_os = "macos")]
const INSTALL_LOCATIONS: &[(&str, ExecutableKind)] = &[
    (
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        ExecutableKind::Chrome,
    ),
    (
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ExecutableKind::Chromium,
    ),
    (
        "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
        ExecutableKind::Edge,
    ),
    (
        "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ExecutableKind::Brave,
    ),
];

#[cfg(target_os = "windows")]
const INSTALL_LOCATIONS: &[(&str, ExecutableKind)] = &[
    (
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        ExecutableKind::Chrome,
    ),
    (
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ExecutableKind::Chrome,
    ),
    (
        r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ExecutableKind::Edge,
    ),
    (
        r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
        ExecutableKind::Brave,
    ),
];

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const INSTALL_LOCATIONS: &[(&str, ExecutableKind)] = &[
    ("/usr/bin/google-chrome", ExecutableKind::Chrome),
    ("/usr/bin/google-chrome-stable", ExecutableKind::Chrome),
    ("/usr/bin/chromium", ExecutableKind::Chromium),
    ("/usr/bin/chromium-browser", ExecutableKind::Chromium),
    ("/snap/bin/chromium", ExecutableKind::Chromium),
    ("/usr/bin/microsoft-edge", ExecutableKind::Edge),
    ("/usr/bin/brave-browser", ExecutableKind::Brave),
];

/// Binary names probed on PATH, in preference order.
const PATH_NAMES: &[(&str, ExecutableKind)] = &[
    ("google-chrome", ExecutableKind::Chrome),
    ("google-chrome-stable", ExecutableKind::Chrome),
    ("chromium", ExecutableKind::Chromium),
    ("chromium-browser", ExecutableKind::Chromium),
    ("chrome", ExecutableKind::Chrome),
    ("msedge", ExecutableKind::Edge),
    ("brave-browser", ExecutableKind::Brave),
];

/// Locate a usable browser binary. Pure lookup: an explicit override wins
/// (and must exist), then known install locations, then PATH. Returns `None`
/// rather than erroring so callers decide how absence is surfaced.
pub fn resolve(explicit: Option<&Path>) -> Option<BrowserExecutable> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(BrowserExecutable {
                path: path.to_path_buf(),
                kind: classify(path),
            });
        }
        debug!("explicit browser executable {} does not exist", path.display());
        return None;
    }

    for (candidate, kind) in INSTALL_LOCATIONS {
        let path = Path::new(candidate);
        if path.is_file() {
            return Some(BrowserExecutable {
                path: path.to_path_buf(),
                kind: *kind,
            });
        }
    }

    for (name, kind) in PATH_NAMES {
        if let Ok(path) = which::which(name) {
            return Some(BrowserExecutable { path, kind: *kind });
        }
    }

    None
}

fn classify(path: &Path) -> ExecutableKind {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.contains("edge") {
        ExecutableKind::Edge
    } else if name.contains("brave") {
        ExecutableKind::Brave
    } else if name.contains("chromium") {
        ExecutableKind::Chromium
    } else {
        ExecutableKind::Chrome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_path_resolves_to_none() {
        let missing = Path::new("/definitely/not/a/browser");
        assert!(resolve(Some(missing)).is_none());
    }

    #[test]
    fn explicit_path_wins_and_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chromium-browser");
        std::fs::write(&path, b"").unwrap();

        let found = resolve(Some(&path)).unwrap();
        assert_eq!(found.kind, ExecutableKind::Chromium);
        assert_eq!(found.path, path);
    }

    #[test]
    fn classify_falls_back_to_chrome() {
        assert_eq!(classify(Path::new("/opt/thing/browser-bin")), ExecutableKind::Chrome);
        assert_eq!(classify(Path::new("/usr/bin/msedge")), ExecutableKind::Edge);
        assert_eq!(classify(Path::new("/usr/bin/brave-browser")), ExecutableKind::Brave);
    }
}
