use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::Session;

/// Process-wide map from signaling-connection identity to its live
/// session. A connection has at most one entry; starting a new session
/// replaces (after stopping) the old one.
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts the session, returning any displaced one. The caller is
    /// responsible for stopping the displaced session.
    pub async fn insert(&self, id: &str, session: Arc<Session>) -> Option<Arc<Session>> {
        self.inner.write().await.insert(id.to_string(), session)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
