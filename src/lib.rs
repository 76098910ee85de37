// ============================================================================
// RustUoW Library
// ============================================================================

pub mod ambient;
pub mod core;
pub mod filter;
pub mod interceptor;
pub mod memory;
pub mod session;
pub mod store;
pub mod uow;

// Re-export main types for convenience
pub use core::{ErrorKind, RestoreGuard, Result, UowError};
pub use ambient::{AmbientContext, AmbientScopeStack, ScopeHandle, spawn};
pub use filter::{
    AuditFieldConfiguration, AuditFields, DataFilterConfiguration, DataFilters, FilterExecutor,
    FilterParameters,
};
pub use session::{AmbientSession, IdentitySource, SessionOverride, StaticIdentity};

// Re-export store contracts
pub use store::{
    ConnectionResolveArgs, ConnectionStringResolver, ConnectionStringsConfig,
    DefaultConnectionStringResolver, IsolationLevel, MultiTenancySide, Session, SessionResolver,
    SessionType, TransactionHandle,
};

// Re-export unit of work API
pub use uow::{
    ActiveUnitOfWork, TransactionScopeOption, UnitOfWorkContext, UnitOfWorkDefaultOptions,
    UnitOfWorkHandle, UnitOfWorkManager, UnitOfWorkOptions, UnitOfWorkState,
};
pub use interceptor::{UnitOfWorkInterceptor, UnitOfWorkPolicy};

// ============================================================================
// Quick start
// ============================================================================

/// Build a manager over the in-memory store with default options
///
/// Every connection string in `databases` is served by its own
/// [`memory::MemoryDatabase`]; the first one is the default.
///
/// # Examples
///
/// ```
/// use rustuow::{AmbientContext, AmbientSession, ConnectionResolveArgs, SessionType};
/// use rustuow::memory::{Entity, MemorySession};
///
/// const ORDERS: SessionType = SessionType::new("Orders");
///
/// # #[tokio::main]
/// # async fn main() -> rustuow::Result<()> {
/// let manager = rustuow::in_memory(&["mem://orders"], AmbientSession::anonymous())?;
///
/// AmbientContext::new()
///     .scope(async {
///         let mut uow = manager.begin_default()?;
///         let session = uow
///             .unit_of_work()
///             .get_or_create::<MemorySession>(ORDERS, ConnectionResolveArgs::new(), None)
///             .await?;
///         session.insert("orders", Entity::new(serde_json::json!({"sku": "A-1"})));
///         uow.complete().await?;
///         uow.dispose().await
///     })
///     .await
/// # }
/// ```
pub fn in_memory(databases: &[&str], session: AmbientSession) -> Result<UnitOfWorkManager> {
    let Some(default) = databases.first() else {
        return Err(UowError::Configuration(
            "at least one connection string is required".into(),
        ));
    };

    let resolver = databases.iter().fold(memory::MemorySessionResolver::new(), |resolver, name| {
        resolver.with_database(name, memory::MemoryDatabase::new(name))
    });
    let connection_strings = DefaultConnectionStringResolver::new(ConnectionStringsConfig::new(default));

    UnitOfWorkManager::new(
        UnitOfWorkDefaultOptions::default(),
        std::sync::Arc::new(connection_strings),
        std::sync::Arc::new(resolver),
        session,
    )
}
