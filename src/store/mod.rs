// ============================================================================
// Store Contracts
// ============================================================================
//
// Boundary with the persistence layer. A unit of work never talks to a
// database directly: it asks a `ConnectionStringResolver` where to go, a
// `SessionResolver` for sessions bound to that place, and drives the
// sessions' save/transaction operations.
//
// ============================================================================

pub mod coordinator;
pub mod registry;
pub mod resolver;

pub use coordinator::{ActiveTransactionInfo, AttendedSession, TransactionCoordinator};
pub use registry::{SessionKey, SessionRegistry};
pub use resolver::{ConnectionStringsConfig, DefaultConnectionStringResolver};

use crate::core::Result;
use crate::uow::UnitOfWorkContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Opaque physical connection shared by sessions of one store
pub type ConnectionHandle = Arc<dyn Any + Send + Sync>;

/// Explicit type identifier for a session kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionType(&'static str);

impl SessionType {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Which side of a multi-tenant deployment a session serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiTenancySide {
    Host,
    Tenant,
}

/// Extra key naming an explicit connection string
pub const CONNECTION_STRING_NAME_KEY: &str = "ConnectionStringName";
/// Extra key carrying the session type name
pub const SESSION_TYPE_KEY: &str = "SessionType";
/// Extra key carrying the current company id
pub const COMPANY_ID_KEY: &str = "CompanyId";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionResolveArgs {
    pub multi_tenancy_side: Option<MultiTenancySide>,
    pub extra_keys: HashMap<String, serde_json::Value>,
}

impl ConnectionResolveArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn side(mut self, side: MultiTenancySide) -> Self {
        self.multi_tenancy_side = Some(side);
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra_keys.insert(key.to_string(), value.into());
        self
    }

    pub fn named(self, connection_string_name: &str) -> Self {
        self.with_extra(CONNECTION_STRING_NAME_KEY, connection_string_name)
    }

    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra_keys.get(key)
    }
}

/// Outcome of asking a session to join an existing transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAttach {
    /// The session now runs inside the shared transaction.
    Attached,
    /// The store cannot share one transaction across sessions.
    Unsupported,
}

/// A physical transaction
#[async_trait]
pub trait TransactionHandle: Send + Sync {
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// ORM-level handle through which entities are read and written
#[async_trait]
pub trait Session: Send + Sync {
    fn session_type(&self) -> SessionType;

    /// Physical connection this session is bound to
    fn connection(&self) -> ConnectionHandle;

    /// Flush tracked changes; returns the number of changes written
    async fn save_changes(&self) -> Result<usize>;

    /// Drop tracked changes that were never saved
    async fn discard_changes(&self) -> Result<()>;

    async fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn TransactionHandle>>;

    async fn attach_transaction(
        &self,
        transaction: &Arc<dyn TransactionHandle>,
    ) -> Result<TransactionAttach>;

    /// Called once for every session newly created inside a unit of work
    fn initialize(&self, _context: &UnitOfWorkContext) -> Result<()> {
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
pub trait ConnectionStringResolver: Send + Sync {
    async fn resolve(&self, args: &ConnectionResolveArgs) -> Result<String>;
}

#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Create a session; with `existing` set, bind it to that physical connection
    async fn resolve(
        &self,
        session_type: SessionType,
        connection_string: &str,
        existing: Option<ConnectionHandle>,
    ) -> Result<Arc<dyn Session>>;

    fn release(&self, session: Arc<dyn Session>);
}
