// ============================================================================
// Memory Session
// ============================================================================
//
// Tracks writes until `save_changes`, stamps tenant and audit fields from the
// unit of work context, and reads through the context's data filters.
//
// Reads see committed rows plus whatever is pending on the session's
// transaction, so sessions attached to one transaction see each other's
// saved writes.
//
// ============================================================================

use super::change::Change;
use super::database::{JournalEntry, MemoryConnection, MemoryDatabase};
use super::entity::{Entity, Tenancy};
use super::filter::MemoryFilterExecutor;
use super::transaction::{MemoryTransaction, TransactionId};
use crate::core::{Result, UowError, lock};
use crate::filter::{AuditFields, FilterExecutor};
use crate::store::{
    ConnectionHandle, IsolationLevel, Session, SessionType, TransactionAttach, TransactionHandle,
};
use crate::uow::UnitOfWorkContext;
use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

pub struct MemorySession {
    id: u64,
    session_type: SessionType,
    connection: Arc<MemoryConnection>,
    transaction: Mutex<Option<Arc<MemoryTransaction>>>,
    tracked: Mutex<Vec<Change>>,
    context: Mutex<Option<UnitOfWorkContext>>,
}

impl MemorySession {
    pub fn new(session_type: SessionType, connection: Arc<MemoryConnection>) -> Self {
        Self {
            id: connection.database().next_session_id(),
            session_type,
            connection,
            transaction: Mutex::new(None),
            tracked: Mutex::new(Vec::new()),
            context: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        self.connection.database()
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        lock(&self.transaction).as_ref().map(|t| t.id())
    }

    pub fn context(&self) -> Option<UnitOfWorkContext> {
        lock(&self.context).clone()
    }

    /// Number of tracked, unsaved changes
    pub fn tracked_count(&self) -> usize {
        lock(&self.tracked).len()
    }

    /// Track a new entity; returns the id it is assigned
    pub fn insert(&self, table: &str, mut entity: Entity) -> u64 {
        entity.id = self.connection.database().next_entity_id();
        let id = entity.id;
        lock(&self.tracked).push(Change::Insert {
            table: table.to_string(),
            entity,
        });
        id
    }

    /// Track a modification of an entity previously read
    pub fn update(&self, table: &str, entity: Entity) {
        lock(&self.tracked).push(Change::Update {
            table: table.to_string(),
            entity,
        });
    }

    /// Track a deletion; soft-deletable entities are only flagged
    pub fn delete(&self, table: &str, entity: Entity) {
        lock(&self.tracked).push(Change::Delete {
            table: table.to_string(),
            entity,
        });
    }

    /// Rows of `table` visible under the current filters
    pub async fn list(&self, table: &str) -> Vec<Entity> {
        let mut rows = self.connection.database().table_image(table).await;
        let pending = lock(&self.transaction)
            .as_ref()
            .map(|t| t.pending())
            .unwrap_or_default();
        for change in pending.iter().filter(|c| c.table_name() == table) {
            change.apply_to(&mut rows);
        }

        let rows: Vec<Entity> = rows.into_values().collect();
        match self.context() {
            Some(context) => MemoryFilterExecutor.apply(&context.filters(), rows),
            None => rows,
        }
    }

    pub async fn find(&self, table: &str, id: u64) -> Option<Entity> {
        self.list(table).await.into_iter().find(|e| e.id == id)
    }

    fn stamp(&self, change: Change) -> Result<Change> {
        let context = self.context();
        let audited = |field: &str| {
            context
                .as_ref()
                .is_some_and(|c| c.is_auditing_enabled(field).unwrap_or(false))
        };
        let user_id = context.as_ref().and_then(UnitOfWorkContext::user_id);
        let now = Utc::now();

        match change {
            Change::Insert { table, mut entity } => {
                if entity.tenancy != Tenancy::None && entity.company_id.is_none() {
                    entity.company_id = context.as_ref().and_then(UnitOfWorkContext::company_id);
                }
                if entity.tenancy == Tenancy::MustHave && entity.company_id.is_none() {
                    return Err(UowError::InvalidCompanyId(format!(
                        "{} requires a company but none is set",
                        table
                    )));
                }
                entity.creation_time.get_or_insert(now);
                if audited(AuditFields::CREATOR_USER_ID) {
                    entity.creator_user_id = user_id;
                }
                Ok(Change::Insert { table, entity })
            }
            Change::Update { table, mut entity } => {
                if audited(AuditFields::LAST_MODIFIER_USER_ID) {
                    entity.last_modifier_user_id = user_id;
                }
                if audited(AuditFields::LAST_MODIFICATION_TIME) {
                    entity.last_modification_time = Some(now);
                }
                Ok(Change::Update { table, entity })
            }
            Change::Delete { table, mut entity } if entity.soft_delete => {
                entity.is_deleted = true;
                if audited(AuditFields::DELETER_USER_ID) {
                    entity.deleter_user_id = user_id;
                }
                if audited(AuditFields::DELETION_TIME) {
                    entity.deletion_time = Some(now);
                }
                Ok(Change::Update { table, entity })
            }
            delete @ Change::Delete { .. } => Ok(delete),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn session_type(&self) -> SessionType {
        self.session_type
    }

    fn connection(&self) -> ConnectionHandle {
        self.connection.clone()
    }

    async fn save_changes(&self) -> Result<usize> {
        let tracked = lock(&self.tracked).clone();
        if tracked.is_empty() {
            return Ok(0);
        }

        let changes = tracked
            .into_iter()
            .map(|change| self.stamp(change))
            .collect::<Result<Vec<_>>>()?;
        let count = changes.len();

        let transaction = lock(&self.transaction).clone();
        match transaction {
            Some(transaction) => transaction.record(changes)?,
            None => {
                self.connection.database().apply(&changes).await?;
            }
        }
        lock(&self.tracked).drain(..count);

        self.connection.database().record(JournalEntry::ChangesSaved {
            session: self.id,
            count,
        });
        debug!(session = self.id, count, "Changes saved");
        Ok(count)
    }

    async fn discard_changes(&self) -> Result<()> {
        lock(&self.tracked).clear();
        Ok(())
    }

    async fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn TransactionHandle>> {
        let transaction = self.connection.database().begin(isolation_level, timeout);
        *lock(&self.transaction) = Some(transaction.clone());
        Ok(transaction)
    }

    async fn attach_transaction(
        &self,
        transaction: &Arc<dyn TransactionHandle>,
    ) -> Result<TransactionAttach> {
        let db = self.connection.database();
        if !db.supports_shared_transactions() {
            return Ok(TransactionAttach::Unsupported);
        }

        let Ok(shared) = transaction.clone().into_any().downcast::<MemoryTransaction>() else {
            return Ok(TransactionAttach::Unsupported);
        };
        if !Arc::ptr_eq(shared.database(), db) {
            return Err(UowError::Transaction(format!(
                "Transaction {} belongs to database '{}', not '{}'",
                shared.id(),
                shared.database().name(),
                db.name()
            )));
        }

        *lock(&self.transaction) = Some(shared);
        Ok(TransactionAttach::Attached)
    }

    fn initialize(&self, context: &UnitOfWorkContext) -> Result<()> {
        *lock(&self.context) = Some(context.clone());
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("session_type", &self.session_type)
            .field("connection", &self.connection.id())
            .field("transaction", &self.transaction_id())
            .finish()
    }
}
