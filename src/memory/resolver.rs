use super::database::{JournalEntry, MemoryConnection, MemoryDatabase};
use super::session::MemorySession;
use crate::core::{Result, UowError};
use crate::store::{ConnectionHandle, Session, SessionResolver, SessionType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Creates `MemorySession`s for registered connection strings
#[derive(Default)]
pub struct MemorySessionResolver {
    databases: HashMap<String, Arc<MemoryDatabase>>,
    resolved: AtomicUsize,
    released: AtomicUsize,
}

impl MemorySessionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `db` under `connection_string`
    pub fn with_database(mut self, connection_string: &str, db: Arc<MemoryDatabase>) -> Self {
        self.databases.insert(connection_string.to_string(), db);
        self
    }

    pub fn database(&self, connection_string: &str) -> Option<&Arc<MemoryDatabase>> {
        self.databases.get(connection_string)
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Sessions handed out and not yet released
    pub fn open_count(&self) -> usize {
        self.resolved_count().saturating_sub(self.released_count())
    }
}

#[async_trait]
impl SessionResolver for MemorySessionResolver {
    async fn resolve(
        &self,
        session_type: SessionType,
        connection_string: &str,
        existing: Option<ConnectionHandle>,
    ) -> Result<Arc<dyn Session>> {
        let db = self.databases.get(connection_string).ok_or_else(|| {
            UowError::Resource(format!("Unknown connection string '{}'", connection_string))
        })?;

        let connection = match existing {
            Some(handle) => handle.downcast::<MemoryConnection>().map_err(|_| {
                UowError::Resource(format!(
                    "Connection for '{}' is not a memory connection",
                    connection_string
                ))
            })?,
            None => Arc::new(db.connect()),
        };
        if !Arc::ptr_eq(connection.database(), db) {
            return Err(UowError::Resource(format!(
                "Connection belongs to database '{}', not '{}'",
                connection.database().name(),
                db.name()
            )));
        }

        let session = MemorySession::new(session_type, connection);
        self.resolved.fetch_add(1, Ordering::SeqCst);
        debug!(session = session.id(), session_type = %session_type, db = db.name(), "Session resolved");
        Ok(Arc::new(session))
    }

    fn release(&self, session: Arc<dyn Session>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        if let Ok(session) = session.into_any().downcast::<MemorySession>() {
            session
                .database()
                .record(JournalEntry::SessionReleased {
                    session: session.id(),
                });
        }
    }
}
