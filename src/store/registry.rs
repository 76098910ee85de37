use super::{Session, SessionType};
use crate::core::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cache key: one session per (type, connection string, logical name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_type: SessionType,
    pub connection_string: String,
    pub name: Option<String>,
}

impl SessionKey {
    /// Key for `session_type` on `connection_string`, optionally under a logical `name`
    pub fn new(session_type: SessionType, connection_string: &str, name: Option<&str>) -> Self {
        Self {
            session_type,
            connection_string: connection_string.to_string(),
            name: name.map(str::to_string),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}#{}@{}", self.session_type, name, self.connection_string),
            None => write!(f, "{}@{}", self.session_type, self.connection_string),
        }
    }
}

/// Sessions owned by one unit of work, in creation order
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<(SessionKey, Arc<dyn Session>)>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached session for `key` or build one with `create`.
    ///
    /// The lock is held while `create` runs, so concurrent callers asking for
    /// the same key get the same instance.
    pub async fn get_or_create<F, Fut>(&self, key: SessionKey, create: F) -> Result<Arc<dyn Session>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Session>>>,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some((_, session)) = sessions.iter().find(|(k, _)| *k == key) {
            return Ok(session.clone());
        }

        let session = create().await?;
        sessions.push((key, session.clone()));
        Ok(session)
    }

    /// The cached session for `key`, without creating one
    pub async fn get(&self, key: &SessionKey) -> Option<Arc<dyn Session>> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, session)| session.clone())
    }

    /// Every cached session, in creation order
    pub async fn sessions(&self) -> Vec<Arc<dyn Session>> {
        let sessions = self.sessions.lock().await;
        sessions.iter().map(|(_, session)| session.clone()).collect()
    }

    /// Remove and return every session
    pub async fn drain(&self) -> Vec<Arc<dyn Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.drain(..).map(|(_, session)| session).collect()
    }

    /// Number of cached sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
