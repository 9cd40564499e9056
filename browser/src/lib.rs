pub mod cdp;
pub mod config;
pub mod executable;
pub mod handlers;
pub mod launcher;
pub mod page;
pub mod readiness;
pub mod registry;
pub mod session;
pub mod snapshot;

pub use config::LaunchOptions;
pub use config::ViewportConfig;
pub use config::WaitStrategy;
pub use executable::BrowserExecutable;
pub use launcher::LaunchedProcess;
pub use registry::SessionRegistry;
pub use session::Session;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unknown ref: {0} (take a new snapshot first)")]
    UnknownRef(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("no supported browser executable found")]
    ExecutableNotFound,

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("CDP error: {0}")]
    CdpError(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("session is shutting down")]
    SessionClosing,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BrowserError {
    /// Machine-readable taxonomy code carried in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) | Self::UnknownRef(_) | Self::ElementNotFound(_) => {
                "not_found"
            }
            Self::InvalidRequest(_) => "invalid_input",
            Self::Timeout(_) => "timeout",
            Self::ExecutableNotFound
            | Self::LaunchFailed(_)
            | Self::CdpError(_)
            | Self::ConnectionClosed
            | Self::IoError(_) => "external",
            Self::SessionClosing => "conflict",
        }
    }
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        BrowserError::CdpError(e.to_string())
    }
}

impl From<serde_json::Error> for BrowserError {
    fn from(e: serde_json::Error) -> Self {
        BrowserError::InvalidRequest(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes_cover_every_variant() {
        assert_eq!(BrowserError::SessionNotFound("s1".into()).code(), "not_found");
        assert_eq!(BrowserError::UnknownRef("e9".into()).code(), "not_found");
        assert_eq!(BrowserError::InvalidRequest("bad".into()).code(), "invalid_input");
        assert_eq!(BrowserError::Timeout("dialog".into()).code(), "timeout");
        assert_eq!(BrowserError::ExecutableNotFound.code(), "external");
        assert_eq!(BrowserError::ConnectionClosed.code(), "external");
        assert_eq!(BrowserError::SessionClosing.code(), "conflict");
    }
}
