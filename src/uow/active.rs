// ============================================================================
// Active Unit of Work
// ============================================================================
//
// One logical unit of work: owns the filter context, the sessions created
// inside it and (when transactional) the transactions those sessions run in.
//
// complete  = save every session, then commit every transaction
// dispose   = roll back if not completed, release every session
//
// ============================================================================

use super::context::UnitOfWorkContext;
use super::events::UnitOfWorkEvents;
use super::options::UnitOfWorkOptions;
use super::state::{Lifecycle, UnitOfWorkId, UnitOfWorkState};
use crate::core::{RestoreGuard, Result, UowError, lock};
use crate::filter::{AuditRegistry, DataFilterConfiguration, FilterRegistry};
use crate::store::{
    COMPANY_ID_KEY, ConnectionResolveArgs, ConnectionStringResolver, SESSION_TYPE_KEY, Session,
    SessionKey, SessionRegistry, SessionResolver, SessionType, TransactionCoordinator,
};
use crate::uow::UnitOfWorkDefaultOptions;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Collaborators a unit of work resolves connections and sessions through
#[derive(Clone)]
pub struct StoreResolvers {
    pub connection_strings: Arc<dyn ConnectionStringResolver>,
    pub sessions: Arc<dyn SessionResolver>,
}

impl StoreResolvers {
    /// Bundle the two resolvers
    pub fn new(
        connection_strings: Arc<dyn ConnectionStringResolver>,
        sessions: Arc<dyn SessionResolver>,
    ) -> Self {
        Self {
            connection_strings,
            sessions,
        }
    }
}

/// One logical unit of work, shared by every handle that joined it
pub struct ActiveUnitOfWork {
    id: UnitOfWorkId,
    options: UnitOfWorkOptions,
    context: UnitOfWorkContext,
    lifecycle: Mutex<Lifecycle>,
    events: UnitOfWorkEvents,
    sessions: SessionRegistry,
    transactions: TransactionCoordinator,
    resolvers: StoreResolvers,
    // keeps the seeded company id in place for the whole unit of work
    seed: Mutex<Option<RestoreGuard>>,
}

impl ActiveUnitOfWork {
    /// Build and activate a unit of work; `options` must already carry defaults
    pub(crate) fn start(
        options: UnitOfWorkOptions,
        defaults: &UnitOfWorkDefaultOptions,
        resolvers: StoreResolvers,
        company_id: Option<i32>,
        user_id: Option<i64>,
    ) -> Result<Arc<Self>> {
        let id = UnitOfWorkId::new();

        let mut filters = FilterRegistry::new(&defaults.filters);
        filters.apply_overrides(&options.filter_overrides);
        let context = UnitOfWorkContext::new(
            id,
            filters,
            AuditRegistry::new(&defaults.audit_fields),
            user_id,
        );
        let seed = context.set_company_id(company_id, false)?;

        let transactions = TransactionCoordinator::new(options.isolation(), options.timeout);
        let mut lifecycle = Lifecycle::new(id);
        lifecycle.activate();

        debug!(
            uow = %id,
            transactional = options.is_transactional(),
            scope = ?options.scope_option(),
            company_id = ?company_id,
            "Unit of work started"
        );

        Ok(Arc::new(Self {
            id,
            options,
            context,
            lifecycle: Mutex::new(lifecycle),
            events: UnitOfWorkEvents::default(),
            sessions: SessionRegistry::new(),
            transactions,
            resolvers,
            seed: Mutex::new(Some(seed)),
        }))
    }

    /// Unique id, also used in log records
    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    /// Options fixed when the unit of work started
    pub fn options(&self) -> &UnitOfWorkOptions {
        &self.options
    }

    /// Whether sessions run inside coordinated transactions
    pub fn is_transactional(&self) -> bool {
        self.options.is_transactional()
    }

    /// Current lifecycle state
    pub fn state(&self) -> UnitOfWorkState {
        lock(&self.lifecycle).state()
    }

    /// Filter, company and audit state shared with every session
    pub fn context(&self) -> &UnitOfWorkContext {
        &self.context
    }

    /// Event listeners
    pub fn events(&self) -> &UnitOfWorkEvents {
        &self.events
    }

    /// Run `handler` after a successful commit
    pub fn on_completed<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.on_completed(handler);
    }

    /// Run `handler` when the unit of work is disposed without completing.
    ///
    /// It receives the first recorded failure and whether that failure is
    /// retriable.
    pub fn on_failed<F>(&self, handler: F)
    where
        F: Fn(Option<&UowError>, bool) + Send + Sync + 'static,
    {
        self.events.on_failed(handler);
    }

    /// Run `handler` once disposal has released everything
    pub fn on_disposed<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.on_disposed(handler);
    }

    /// The failure recorded so far, reported to `Failed` listeners on dispose
    pub fn failure(&self) -> Option<UowError> {
        lock(&self.lifecycle).failure().cloned()
    }

    /// Record the failure of the work running inside this unit of work
    pub fn fail(&self, error: UowError) {
        lock(&self.lifecycle).record_failure(error);
    }

    pub(crate) fn mark_rollback_only(&self, error: UowError) {
        lock(&self.lifecycle).mark_rollback_only(error);
    }

    // ------------------------------------------------------------------
    // Filters, company and auditing
    // ------------------------------------------------------------------

    /// See [`UnitOfWorkContext::disable_filter`]
    pub fn disable_filter(&self, names: &[&str]) -> Result<RestoreGuard> {
        self.context.disable_filter(names)
    }

    /// See [`UnitOfWorkContext::enable_filter`]
    pub fn enable_filter(&self, names: &[&str]) -> Result<RestoreGuard> {
        self.context.enable_filter(names)
    }

    /// Whether the filter `name` is currently on
    pub fn is_filter_enabled(&self, name: &str) -> Result<bool> {
        self.context.is_filter_enabled(name)
    }

    /// Current configuration of every filter
    pub fn filters(&self) -> Vec<DataFilterConfiguration> {
        self.context.filters()
    }

    /// Override one filter parameter until the guard is released
    pub fn set_filter_parameter(
        &self,
        filter: &str,
        parameter: &str,
        value: impl Into<JsonValue>,
    ) -> Result<RestoreGuard> {
        self.context.set_filter_parameter(filter, parameter, value)
    }

    /// Act for `company_id` until the guard is released.
    ///
    /// See [`UnitOfWorkContext::set_company_id`] for the filter switching
    /// rules.
    ///
    /// # Errors
    /// `InvalidCompanyId` for `Some(0)`.
    pub fn set_company_id(
        &self,
        company_id: Option<i32>,
        switch_required_filter: bool,
    ) -> Result<RestoreGuard> {
        self.context.set_company_id(company_id, switch_required_filter)
    }

    /// Company the unit of work currently acts for; `None` is the host
    pub fn company_id(&self) -> Option<i32> {
        self.context.company_id()
    }

    /// Stop stamping the named audit fields until the guard is released
    pub fn disable_auditing(&self, field_names: &[&str]) -> Result<RestoreGuard> {
        self.context.disable_auditing(field_names)
    }

    /// Stamp the named audit fields until the guard is released
    pub fn enable_auditing(&self, field_names: &[&str]) -> Result<RestoreGuard> {
        self.context.enable_auditing(field_names)
    }

    /// Whether `field_name` is stamped on save
    pub fn is_auditing_enabled(&self, field_name: &str) -> Result<bool> {
        self.context.is_auditing_enabled(field_name)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Session for (`session_type`, resolved connection string, `name`),
    /// created on first request and reused afterwards.
    pub async fn get_or_create_session(
        &self,
        session_type: SessionType,
        args: ConnectionResolveArgs,
        name: Option<&str>,
    ) -> Result<Arc<dyn Session>> {
        lock(&self.lifecycle).ensure_active()?;

        let mut args = args.with_extra(SESSION_TYPE_KEY, session_type.name());
        if let Some(company_id) = self.context.company_id() {
            args = args.with_extra(COMPANY_ID_KEY, company_id);
        }
        let connection_string = self.resolvers.connection_strings.resolve(&args).await?;
        let key = SessionKey::new(session_type, &connection_string, name);

        let result = self
            .sessions
            .get_or_create(key, || self.create_session(session_type, &connection_string))
            .await;

        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    /// Typed variant of [`ActiveUnitOfWork::get_or_create_session`]
    pub async fn get_or_create<S>(
        &self,
        session_type: SessionType,
        args: ConnectionResolveArgs,
        name: Option<&str>,
    ) -> Result<Arc<S>>
    where
        S: Session + Any,
    {
        let session = self.get_or_create_session(session_type, args, name).await?;
        session.into_any().downcast::<S>().map_err(|_| {
            UowError::Session(format!(
                "Session registered for {} is not a {}",
                session_type,
                std::any::type_name::<S>()
            ))
        })
    }

    async fn create_session(
        &self,
        session_type: SessionType,
        connection_string: &str,
    ) -> Result<Arc<dyn Session>> {
        let resolver = self.resolvers.sessions.as_ref();
        let session = if self.is_transactional() {
            self.transactions
                .create_session(resolver, session_type, connection_string)
                .await?
        } else {
            resolver.resolve(session_type, connection_string, None).await?
        };

        // A transactional session is already tracked by the coordinator and
        // is released by it on dispose.
        if let Err(err) = session.initialize(&self.context) {
            if !self.is_transactional() {
                resolver.release(session);
            }
            return Err(err);
        }

        debug!(uow = %self.id, session_type = %session_type, "Session created");
        Ok(session)
    }

    /// Number of sessions created so far
    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    /// Number of physical transactions started (one per connection string)
    pub async fn transaction_count(&self) -> usize {
        self.transactions.transaction_count().await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Flush every session; may be called any number of times before completion
    pub async fn save_changes(&self) -> Result<()> {
        lock(&self.lifecycle).ensure_active()?;
        let result = self.save_all().await;
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    /// Blocking counterpart of [`ActiveUnitOfWork::save_changes`]
    pub fn save_changes_blocking(&self) -> Result<()> {
        futures::executor::block_on(self.save_changes())
    }

    async fn save_all(&self) -> Result<()> {
        for session in self.sessions.sessions().await {
            session.save_changes().await?;
        }
        Ok(())
    }

    /// Save, then commit; raises `Completed` on success.
    ///
    /// # Errors
    /// `CompleteCalledTwice` on a second call, whatever the first returned.
    pub(crate) async fn complete(&self) -> Result<()> {
        lock(&self.lifecycle).begin_complete()?;

        let result: Result<()> = async {
            self.save_all().await?;
            if self.is_transactional() {
                self.transactions.commit().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                lock(&self.lifecycle).mark_completed();
                debug!(uow = %self.id, "Unit of work completed");
                self.events.raise_completed();
                Ok(())
            }
            Err(err) => {
                warn!(uow = %self.id, "Unit of work failed to complete: {}", err);
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Release everything; rolls back first unless `complete` succeeded.
    ///
    /// Runs at most once; later calls are no-ops. Cleanup always runs to the
    /// end and the first cleanup error is returned afterwards.
    pub(crate) async fn dispose(&self) -> Result<()> {
        let Some(completed) = lock(&self.lifecycle).begin_dispose() else {
            return Ok(());
        };

        let mut first_error: Option<UowError> = None;
        let resolver = self.resolvers.sessions.as_ref();

        if !completed {
            let rollback = if self.is_transactional() {
                self.transactions.rollback().await
            } else {
                self.discard_all().await
            };
            if let Err(err) = rollback {
                error!(uow = %self.id, "Rollback during dispose failed: {}", err);
                first_error.get_or_insert(err);
            }
        }

        let sessions = self.sessions.drain().await;
        if self.is_transactional() {
            self.transactions.dispose(resolver).await;
        } else {
            for session in sessions {
                resolver.release(session);
            }
        }

        if !completed {
            let failure = self.failure();
            debug!(uow = %self.id, failure = ?failure, "Unit of work disposed without completion");
            self.events.raise_failed(failure.as_ref());
        }

        if let Some(seed) = lock(&self.seed).take() {
            seed.release();
        }
        lock(&self.lifecycle).mark_disposed();
        self.events.raise_disposed();
        debug!(uow = %self.id, completed, "Unit of work disposed");

        first_error.map_or(Ok(()), Err)
    }

    async fn discard_all(&self) -> Result<()> {
        let mut first_error = None;
        for session in self.sessions.sessions().await {
            if let Err(err) = session.discard_changes().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for ActiveUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveUnitOfWork")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("options", &self.options)
            .finish()
    }
}
