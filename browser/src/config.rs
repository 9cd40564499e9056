use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

/// Options accepted by the `launch` operation. Everything is optional so a
/// bare `{}` body launches a headed browser with a throwaway profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOptions {
    #[serde(default)]
    pub headless: bool,

    /// Explicit remote-debugging port. When unset one is probed from a
    /// bounded range.
    #[serde(default)]
    pub port: Option<u16>,

    /// Named persistent profile. Maps deterministically to a directory under
    /// the per-user data root; implies a native launch.
    #[serde(default)]
    pub profile: Option<String>,

    /// Explicit browser binary, overriding platform discovery.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Disable the Chromium sandbox (containers, CI).
    #[serde(default)]
    pub no_sandbox: bool,

    #[serde(default = "default_viewport")]
    pub viewport: ViewportConfig,

    #[serde(default = "default_wait")]
    pub wait: WaitStrategy,

    #[serde(default)]
    pub locale: Option<String>,

    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub accept_language: Option<String>,

    #[serde(default)]
    pub user_agent: Option<String>,

    /// Where accepted downloads land. Defaults to a per-session directory
    /// under the system temp dir.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: false,
            port: None,
            profile: None,
            executable: None,
            no_sandbox: false,
            viewport: default_viewport(),
            wait: default_wait(),
            locale: None,
            timezone: None,
            accept_language: None,
            user_agent: None,
            download_dir: None,
        }
    }
}

impl LaunchOptions {
    /// True when the caller pinned something only a native launch can honor.
    pub fn requires_native(&self) -> bool {
        self.profile.is_some() || self.port.is_some() || self.executable.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,

    #[serde(default = "default_device_scale_factor")]
    pub device_scale_factor: f64,

    #[serde(default)]
    pub mobile: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitStrategy {
    Event(String),
    Delay { delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Webp,
}

fn default_viewport() -> ViewportConfig {
    ViewportConfig {
        width: 1280,
        height: 720,
        device_scale_factor: 1.0,
        mobile: false,
    }
}

fn default_wait() -> WaitStrategy {
    // "load" tracks SPA hydration better than a fixed networkidle sleep.
    WaitStrategy::Event("load".to_string())
}

fn default_device_scale_factor() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_yields_defaults() {
        let opts: LaunchOptions = serde_json::from_str("{}").unwrap();
        assert!(!opts.headless);
        assert!(opts.port.is_none());
        assert_eq!(opts.viewport.width, 1280);
        assert!(!opts.requires_native());
    }

    #[test]
    fn pinned_profile_requires_native() {
        let opts: LaunchOptions =
            serde_json::from_value(serde_json::json!({"profile": "work"})).unwrap();
        assert!(opts.requires_native());
    }

    #[test]
    fn wait_strategy_accepts_both_shapes() {
        let opts: LaunchOptions =
            serde_json::from_value(serde_json::json!({"wait": "domcontentloaded"})).unwrap();
        assert!(matches!(opts.wait, WaitStrategy::Event(ref e) if e == "domcontentloaded"));

        let opts: LaunchOptions =
            serde_json::from_value(serde_json::json!({"wait": {"delay_ms": 250}})).unwrap();
        assert!(matches!(opts.wait, WaitStrategy::Delay { delay_ms: 250 }));
    }
}
