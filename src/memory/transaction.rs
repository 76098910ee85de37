// ============================================================================
// Memory Transactions
// ============================================================================
//
// Active ──commit──> Committed
//   │
//   └──rollback / failed commit──> Aborted
//
// Saved changes stay pending on the transaction and reach the tables only
// at commit, where versions are checked again. Every session attached to
// the transaction sees the pending changes on reads.
//
// ============================================================================

use super::change::Change;
use super::database::{JournalEntry, MemoryDatabase};
use crate::core::{Result, UowError, lock};
use crate::store::{IsolationLevel, TransactionHandle};
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

pub struct MemoryTransaction {
    id: TransactionId,
    db: Arc<MemoryDatabase>,
    isolation_level: IsolationLevel,
    deadline: Option<Instant>,
    state: Mutex<TransactionState>,
    pending: Mutex<Vec<Change>>,
}

impl MemoryTransaction {
    pub(crate) fn new(
        db: Arc<MemoryDatabase>,
        isolation_level: IsolationLevel,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            db,
            isolation_level,
            deadline: timeout.map(|t| Instant::now() + t),
            state: Mutex::new(TransactionState::Active),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *lock(&self.state)
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub(crate) fn pending(&self) -> Vec<Change> {
        lock(&self.pending).clone()
    }

    /// Queue saved changes until commit
    pub(crate) fn record(&self, changes: Vec<Change>) -> Result<()> {
        let state = self.state();
        if !state.is_active() {
            return Err(UowError::Transaction(format!(
                "Cannot record changes: transaction {} is {}",
                self.id, state
            )));
        }
        lock(&self.pending).extend(changes);
        Ok(())
    }

    fn abort(&self) {
        *lock(&self.state) = TransactionState::Aborted;
        lock(&self.pending).clear();
        self.db.record(JournalEntry::RolledBack {
            transaction: self.id,
        });
    }
}

#[async_trait]
impl TransactionHandle for MemoryTransaction {
    async fn commit(&self) -> Result<()> {
        let state = self.state();
        if !state.is_active() {
            return Err(UowError::Transaction(format!(
                "Cannot commit: transaction {} is already {}",
                self.id, state
            )));
        }

        if self.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            warn!(transaction = %self.id, "Transaction timed out before commit");
            self.abort();
            return Err(UowError::Transaction(format!(
                "Transaction {} timed out",
                self.id
            )));
        }

        let changes = self.pending();
        match self.db.apply(&changes).await {
            Ok(count) => {
                *lock(&self.state) = TransactionState::Committed;
                lock(&self.pending).clear();
                self.db.record(JournalEntry::Committed {
                    transaction: self.id,
                    changes: count,
                });
                debug!(transaction = %self.id, changes = count, "Transaction committed");
                Ok(())
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    /// Rolling back a finished transaction is a no-op
    async fn rollback(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.abort();
        debug!(transaction = %self.id, "Transaction rolled back");
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("isolation_level", &self.isolation_level)
            .finish()
    }
}
