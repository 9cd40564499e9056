use crate::BrowserError;
use crate::Result;
use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// In-memory table of active sessions. An explicit object rather than a
/// process-wide static so multiple orchestrators can coexist in tests; the
/// lock makes insert/remove atomic under real parallelism.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        info!("registering session {}", session.id);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    /// Unresolvable ids are a client error, not a transient condition.
    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BrowserError::SessionNotFound(session_id.to_string()))
    }

    /// Remove and return the session. `close` is the only caller; removal
    /// happening first is what makes a second close observe not-found instead
    /// of racing the teardown.
    pub async fn remove(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| BrowserError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drain and tear down everything. Used at process shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in drained {
            session.teardown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_on_unknown_id_is_a_not_found_error() {
        let registry = SessionRegistry::new();
        let err = registry.get("nope").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn remove_on_unknown_id_is_a_not_found_error() {
        let registry = SessionRegistry::new();
        assert!(registry.remove("gone").await.is_err());
        assert!(registry.is_empty().await);
    }
}
