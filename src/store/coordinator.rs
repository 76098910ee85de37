// ============================================================================
// Transaction Coordinator
// ============================================================================
//
// One physical transaction per connection string inside a unit of work.
// The first session resolved for a connection string starts the transaction;
// later sessions are bound to the same physical connection and join it.
//
// When the store cannot share a transaction across sessions, the joining
// session gets its own transaction instead. Those sessions are no longer
// atomic with the starter; the fallback is logged at warn level.
//
// ============================================================================

use super::{
    IsolationLevel, Session, SessionResolver, SessionType, TransactionAttach, TransactionHandle,
};
use crate::core::{Result, UowError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// A session sharing a connection with the starter
pub struct AttendedSession {
    pub session: Arc<dyn Session>,
    /// Set when the session could not join the shared transaction
    pub own_transaction: Option<Arc<dyn TransactionHandle>>,
}

/// Transaction state for one connection string
pub struct ActiveTransactionInfo {
    pub transaction: Arc<dyn TransactionHandle>,
    pub starter: Arc<dyn Session>,
    pub attended: Vec<AttendedSession>,
}

impl ActiveTransactionInfo {
    fn new(transaction: Arc<dyn TransactionHandle>, starter: Arc<dyn Session>) -> Self {
        Self {
            transaction,
            starter,
            attended: Vec::new(),
        }
    }

    /// Every session on this connection, starter first
    pub fn sessions(&self) -> impl Iterator<Item = &Arc<dyn Session>> {
        std::iter::once(&self.starter).chain(self.attended.iter().map(|a| &a.session))
    }

    /// Attended sessions running on their own transaction
    pub fn independent_count(&self) -> usize {
        self.attended
            .iter()
            .filter(|a| a.own_transaction.is_some())
            .count()
    }
}

pub struct TransactionCoordinator {
    isolation_level: IsolationLevel,
    timeout: Option<Duration>,
    transactions: Mutex<HashMap<String, ActiveTransactionInfo>>,
}

impl TransactionCoordinator {
    pub fn new(isolation_level: IsolationLevel, timeout: Option<Duration>) -> Self {
        Self {
            isolation_level,
            timeout,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a session for `connection_string` inside the shared transaction
    pub async fn create_session(
        &self,
        resolver: &dyn SessionResolver,
        session_type: SessionType,
        connection_string: &str,
    ) -> Result<Arc<dyn Session>> {
        let mut transactions = self.transactions.lock().await;

        match transactions.get_mut(connection_string) {
            Some(active) => {
                self.attend(active, resolver, session_type, connection_string)
                    .await
            }
            None => {
                let session = resolver.resolve(session_type, connection_string, None).await?;
                let transaction = match session
                    .begin_transaction(self.isolation_level, self.timeout)
                    .await
                {
                    Ok(transaction) => transaction,
                    Err(err) => {
                        resolver.release(session);
                        return Err(err);
                    }
                };
                debug!(
                    session_type = %session_type,
                    isolation = ?self.isolation_level,
                    "Started shared transaction"
                );
                transactions.insert(
                    connection_string.to_string(),
                    ActiveTransactionInfo::new(transaction, session.clone()),
                );
                Ok(session)
            }
        }
    }

    /// Bind a new session to the starter's connection and join its transaction
    async fn attend(
        &self,
        active: &mut ActiveTransactionInfo,
        resolver: &dyn SessionResolver,
        session_type: SessionType,
        connection_string: &str,
    ) -> Result<Arc<dyn Session>> {
        let connection = active.starter.connection();
        let session = resolver
            .resolve(session_type, connection_string, Some(connection))
            .await?;

        let own_transaction = match session.attach_transaction(&active.transaction).await {
            Ok(TransactionAttach::Attached) => None,
            Ok(TransactionAttach::Unsupported) => {
                warn!(
                    session_type = %session_type,
                    "Store cannot share a transaction across sessions; \
                     falling back to an independent transaction, atomicity with the \
                     starter session is not guaranteed"
                );
                match session
                    .begin_transaction(self.isolation_level, self.timeout)
                    .await
                {
                    Ok(transaction) => Some(transaction),
                    Err(err) => {
                        resolver.release(session);
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                resolver.release(session);
                return Err(err);
            }
        };

        active.attended.push(AttendedSession {
            session: session.clone(),
            own_transaction,
        });
        Ok(session)
    }

    /// Commit every tracked transaction
    ///
    /// Stops at the first failure; whatever was not committed is rolled back
    /// by the subsequent dispose.
    pub async fn commit(&self) -> Result<()> {
        let transactions = self.transactions.lock().await;
        for active in transactions.values() {
            active.transaction.commit().await?;
            for attended in &active.attended {
                if let Some(transaction) = &attended.own_transaction {
                    transaction.commit().await?;
                }
            }
        }
        debug!(count = transactions.len(), "Committed shared transactions");
        Ok(())
    }

    /// Roll back every tracked transaction; returns the first failure
    pub async fn rollback(&self) -> Result<()> {
        let transactions = self.transactions.lock().await;
        let mut first_error: Option<UowError> = None;

        for active in transactions.values() {
            let handles = active
                .attended
                .iter()
                .filter_map(|a| a.own_transaction.as_ref())
                .chain(std::iter::once(&active.transaction));
            for transaction in handles {
                if let Err(err) = transaction.rollback().await {
                    error!("Rollback failed: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Drop every transaction handle and release every session
    pub async fn dispose(&self, resolver: &dyn SessionResolver) {
        let mut transactions = self.transactions.lock().await;
        for (_, active) in transactions.drain() {
            let ActiveTransactionInfo {
                transaction,
                starter,
                attended,
            } = active;
            drop(transaction);
            for AttendedSession {
                session,
                own_transaction,
            } in attended
            {
                drop(own_transaction);
                resolver.release(session);
            }
            resolver.release(starter);
        }
    }

    pub async fn transaction_count(&self) -> usize {
        self.transactions.lock().await.len()
    }

    /// Number of sessions tracked for `connection_string` (starter included)
    pub async fn session_count(&self, connection_string: &str) -> usize {
        self.transactions
            .lock()
            .await
            .get(connection_string)
            .map_or(0, |active| active.sessions().count())
    }

    pub async fn independent_count(&self, connection_string: &str) -> usize {
        self.transactions
            .lock()
            .await
            .get(connection_string)
            .map_or(0, ActiveTransactionInfo::independent_count)
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("isolation_level", &self.isolation_level)
            .field("timeout", &self.timeout)
            .finish()
    }
}
