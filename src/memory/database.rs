// ============================================================================
// In-Memory Database
// ============================================================================
//
// Tables of `Entity` rows keyed by id. Writes arrive as batches of `Change`
// commands and are applied atomically: every change is checked against the
// current versions first, and nothing is written if any check fails.
//
// ============================================================================

use super::change::Change;
use super::entity::Entity;
use super::transaction::{MemoryTransaction, TransactionId};
use crate::core::{Result, lock};
use crate::store::IsolationLevel;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Observable events of a database, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    TransactionBegun { transaction: TransactionId },
    ChangesSaved { session: u64, count: usize },
    Committed { transaction: TransactionId, changes: usize },
    RolledBack { transaction: TransactionId },
    SessionReleased { session: u64 },
}

pub struct MemoryDatabase {
    name: String,
    tables: RwLock<HashMap<String, BTreeMap<u64, Entity>>>,
    shared_transactions: AtomicBool,
    next_entity_id: AtomicU64,
    next_connection_id: AtomicU64,
    next_session_id: AtomicU64,
    transactions_begun: AtomicUsize,
    journal: Mutex<Vec<JournalEntry>>,
}

impl MemoryDatabase {
    /// Create an empty database that can share transactions across sessions
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tables: RwLock::new(HashMap::new()),
            shared_transactions: AtomicBool::new(true),
            next_entity_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            transactions_begun: AtomicUsize::new(0),
            journal: Mutex::new(Vec::new()),
        })
    }

    /// Whether sessions on one connection may join each other's transaction
    pub fn shared_transactions(self: Arc<Self>, enabled: bool) -> Arc<Self> {
        self.shared_transactions.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn supports_shared_transactions(&self) -> bool {
        self.shared_transactions.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a new physical connection
    pub fn connect(self: &Arc<Self>) -> MemoryConnection {
        MemoryConnection {
            id: self.next_connection_id.fetch_add(1, Ordering::SeqCst),
            db: self.clone(),
        }
    }

    pub(crate) fn begin(
        self: &Arc<Self>,
        isolation_level: IsolationLevel,
        timeout: Option<Duration>,
    ) -> Arc<MemoryTransaction> {
        let transaction = MemoryTransaction::new(self.clone(), isolation_level, timeout);
        self.transactions_begun.fetch_add(1, Ordering::SeqCst);
        self.record(JournalEntry::TransactionBegun {
            transaction: transaction.id(),
        });
        debug!(db = %self.name, transaction = %transaction.id(), "Transaction begun");
        Arc::new(transaction)
    }

    pub(crate) fn next_entity_id(&self) -> u64 {
        self.next_entity_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Apply `changes` atomically
    ///
    /// # Errors
    /// `Concurrency` when a row was changed or removed since it was read;
    /// no change is applied in that case.
    pub(crate) async fn apply(&self, changes: &[Change]) -> Result<usize> {
        let mut tables = self.tables.write().await;

        let mut images: HashMap<&str, BTreeMap<u64, Entity>> = HashMap::new();
        for change in changes {
            let table = change.table_name();
            if !images.contains_key(table) {
                images.insert(table, tables.get(table).cloned().unwrap_or_default());
            }
            if let Some(image) = images.get_mut(table) {
                change.check(Some(image))?;
                change.apply_to(image);
            }
        }

        for (table, image) in images {
            tables.insert(table.to_string(), image);
        }
        Ok(changes.len())
    }

    /// Committed rows of `table`, ordered by id
    pub async fn committed_rows(&self, table: &str) -> Vec<Entity> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn table_image(&self, table: &str) -> BTreeMap<u64, Entity> {
        let tables = self.tables.read().await;
        tables.get(table).cloned().unwrap_or_default()
    }

    pub fn transactions_begun(&self) -> usize {
        self.transactions_begun.load(Ordering::SeqCst)
    }

    pub(crate) fn record(&self, entry: JournalEntry) {
        lock(&self.journal).push(entry);
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.journal).clone()
    }

    /// Number of commits recorded so far
    pub fn commit_count(&self) -> usize {
        lock(&self.journal)
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Committed { .. }))
            .count()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .field("shared_transactions", &self.supports_shared_transactions())
            .finish()
    }
}

/// A physical connection; the `ConnectionHandle` of memory sessions
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    db: Arc<MemoryDatabase>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }
}
