// ============================================================================
// Unit of Work Manager
// ============================================================================
//
// `begin` either joins the ambient current unit of work (Required) or starts
// a new one and pushes it as the current one for the rest of the call chain.
//
// The returned handle is the boundary:
//   - outer handle: owns the unit of work; complete commits, dispose releases
//   - inner handle: joins; its complete/dispose never end the unit of work
//
// ============================================================================

use super::active::{ActiveUnitOfWork, StoreResolvers};
use super::options::{TransactionScopeOption, UnitOfWorkDefaultOptions, UnitOfWorkOptions};
use crate::ambient::{AmbientContext, AmbientScopeStack, ScopeHandle};
use crate::core::{Result, UowError};
use crate::session::AmbientSession;
use crate::store::{ConnectionStringResolver, SessionResolver};
use std::sync::Arc;
use tracing::{debug, error, warn};

static CURRENT_UOW: AmbientScopeStack<Arc<ActiveUnitOfWork>> = AmbientScopeStack::new("uow");

const CURRENT_KEY: &str = "current";

pub struct UnitOfWorkManager {
    defaults: UnitOfWorkDefaultOptions,
    resolvers: StoreResolvers,
    session: AmbientSession,
}

impl UnitOfWorkManager {
    /// # Errors
    /// `Configuration` when `defaults` does not validate.
    pub fn new(
        defaults: UnitOfWorkDefaultOptions,
        connection_strings: Arc<dyn ConnectionStringResolver>,
        sessions: Arc<dyn SessionResolver>,
        session: AmbientSession,
    ) -> Result<Self> {
        defaults.validate().map_err(UowError::Configuration)?;
        Ok(Self {
            defaults,
            resolvers: StoreResolvers::new(connection_strings, sessions),
            session,
        })
    }

    pub fn defaults(&self) -> &UnitOfWorkDefaultOptions {
        &self.defaults
    }

    pub fn session(&self) -> &AmbientSession {
        &self.session
    }

    /// The innermost unit of work begun on this call chain.
    ///
    /// A unit of work that has already been disposed is never reported.
    pub fn current(&self) -> Option<Arc<ActiveUnitOfWork>> {
        CURRENT_UOW
            .get_value(CURRENT_KEY)
            .filter(|uow| !uow.state().is_terminal())
    }

    /// Begin with the configured defaults
    pub fn begin_default(&self) -> Result<UnitOfWorkHandle> {
        self.begin(UnitOfWorkOptions::new())
    }

    /// Begin a unit of work, or join the current one.
    ///
    /// # Errors
    /// `NoAmbientContext` when no call chain root is installed,
    /// `NotActive` when `Required` finds a current unit of work that has
    /// already completed or failed, `InvalidCompanyId` when the ambient
    /// session carries company id 0.
    pub fn begin(&self, mut options: UnitOfWorkOptions) -> Result<UnitOfWorkHandle> {
        if !AmbientContext::is_installed() {
            return Err(UowError::NoAmbientContext);
        }
        self.defaults.apply_to(&mut options);

        if options.scope_option() == TransactionScopeOption::Required {
            if let Some(current) = self.current() {
                if !current.state().is_active() {
                    return Err(UowError::NotActive(format!(
                        "{} ({})",
                        current.id(),
                        current.state()
                    )));
                }
                debug!(uow = %current.id(), "Joining current unit of work");
                return Ok(UnitOfWorkHandle::inner(current));
            }
        }

        let uow = ActiveUnitOfWork::start(
            options,
            &self.defaults,
            self.resolvers.clone(),
            self.session.company_id(),
            self.session.user_id(),
        )?;
        let scope = CURRENT_UOW.begin_scope(CURRENT_KEY, uow.clone())?;
        Ok(UnitOfWorkHandle::outer(uow, scope))
    }
}

impl std::fmt::Debug for UnitOfWorkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkManager")
            .field("defaults", &self.defaults)
            .field("session", &self.session)
            .finish()
    }
}

enum Boundary {
    Outer { scope: Option<ScopeHandle> },
    Inner { completed: bool },
}

/// Boundary of one `begin` call
///
/// Dispose it explicitly. A dropped outer handle is disposed by a detached
/// task on the current tokio runtime, which never runs if that runtime shuts
/// down first.
#[must_use = "dropping the handle immediately disposes the unit of work"]
pub struct UnitOfWorkHandle {
    uow: Arc<ActiveUnitOfWork>,
    boundary: Boundary,
    disposed: bool,
}

impl UnitOfWorkHandle {
    fn outer(uow: Arc<ActiveUnitOfWork>, scope: ScopeHandle) -> Self {
        Self {
            uow,
            boundary: Boundary::Outer { scope: Some(scope) },
            disposed: false,
        }
    }

    fn inner(uow: Arc<ActiveUnitOfWork>) -> Self {
        Self {
            uow,
            boundary: Boundary::Inner { completed: false },
            disposed: false,
        }
    }

    pub fn unit_of_work(&self) -> &Arc<ActiveUnitOfWork> {
        &self.uow
    }

    /// Whether this handle owns the unit of work
    pub fn is_root(&self) -> bool {
        matches!(self.boundary, Boundary::Outer { .. })
    }

    /// Record the failure of the work inside this boundary
    pub fn fail(&self, error: UowError) {
        self.uow.fail(error);
    }

    /// Commit (outer) or vote to commit (inner)
    ///
    /// # Errors
    /// `CompleteCalledTwice` on a second call through the same handle.
    pub async fn complete(&mut self) -> Result<()> {
        match &mut self.boundary {
            Boundary::Outer { .. } => self.uow.complete().await,
            Boundary::Inner { completed } => {
                if *completed {
                    return Err(UowError::CompleteCalledTwice(self.uow.id().to_string()));
                }
                *completed = true;
                Ok(())
            }
        }
    }

    pub fn complete_blocking(&mut self) -> Result<()> {
        futures::executor::block_on(self.complete())
    }

    /// End the boundary.
    ///
    /// An outer handle pops the ambient current and disposes the unit of
    /// work. An inner handle disposed without `complete` marks the unit of
    /// work rollback-only and returns `InnerNotCompleted`.
    pub async fn dispose(mut self) -> Result<()> {
        self.disposed = true;
        match &mut self.boundary {
            Boundary::Inner { completed } => {
                if *completed {
                    Ok(())
                } else {
                    self.uow.mark_rollback_only(UowError::InnerNotCompleted);
                    Err(UowError::InnerNotCompleted)
                }
            }
            Boundary::Outer { scope } => {
                let released = scope.take().map_or(Ok(()), ScopeHandle::release);
                if let Err(err) = &released {
                    error!(uow = %self.uow.id(), "Failed to restore ambient unit of work: {}", err);
                }
                let disposed = self.uow.dispose().await;
                disposed.and(released)
            }
        }
    }

    pub fn dispose_blocking(self) -> Result<()> {
        futures::executor::block_on(self.dispose())
    }
}

impl Drop for UnitOfWorkHandle {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        match &mut self.boundary {
            Boundary::Inner { completed } => {
                if !*completed {
                    self.uow.mark_rollback_only(UowError::InnerNotCompleted);
                }
            }
            Boundary::Outer { scope } => {
                drop(scope.take());
                warn!(uow = %self.uow.id(), "Unit of work handle dropped without dispose");

                // Inside a runtime the dispose is a detached task: if the
                // runtime shuts down before it runs, the rollback and session
                // release never happen. Call `dispose` explicitly to be sure.
                let uow = self.uow.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        debug!(uow = %uow.id(), "Disposing dropped unit of work on the runtime");
                        runtime.spawn(async move {
                            if let Err(err) = uow.dispose().await {
                                error!(uow = %uow.id(), "Implicit dispose failed: {}", err);
                            }
                        });
                    }
                    Err(_) => {
                        if let Err(err) = futures::executor::block_on(uow.dispose()) {
                            error!(uow = %uow.id(), "Implicit dispose failed: {}", err);
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for UnitOfWorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkHandle")
            .field("uow", &self.uow.id())
            .field("root", &self.is_root())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDatabase, MemorySessionResolver};
    use crate::store::{ConnectionStringsConfig, DefaultConnectionStringResolver};
    use crate::uow::UnitOfWorkState;

    fn manager() -> UnitOfWorkManager {
        let sessions = MemorySessionResolver::new()
            .with_database("mem://default", MemoryDatabase::new("default"));
        let connection_strings =
            DefaultConnectionStringResolver::new(ConnectionStringsConfig::new("mem://default"));
        UnitOfWorkManager::new(
            UnitOfWorkDefaultOptions::default(),
            Arc::new(connection_strings),
            Arc::new(sessions),
            AmbientSession::anonymous(),
        )
        .unwrap()
    }

    #[test]
    fn test_begin_requires_ambient_context() {
        let manager = manager();
        assert!(matches!(
            manager.begin_default(),
            Err(UowError::NoAmbientContext)
        ));
    }

    #[test]
    fn test_invalid_defaults_rejected() {
        let result = UnitOfWorkManager::new(
            UnitOfWorkDefaultOptions::new().timeout(std::time::Duration::ZERO),
            Arc::new(DefaultConnectionStringResolver::new(
                ConnectionStringsConfig::new("mem://default"),
            )),
            Arc::new(MemorySessionResolver::new()),
            AmbientSession::anonymous(),
        );
        assert!(matches!(result, Err(UowError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_required_joins_current() {
        let manager = manager();
        AmbientContext::new()
            .scope(async {
                let mut outer = manager.begin_default().unwrap();
                let mut inner = manager.begin(UnitOfWorkOptions::required()).unwrap();

                assert!(outer.is_root());
                assert!(!inner.is_root());
                assert!(Arc::ptr_eq(outer.unit_of_work(), inner.unit_of_work()));

                inner.complete().await.unwrap();
                inner.dispose().await.unwrap();
                assert_eq!(outer.unit_of_work().state(), UnitOfWorkState::Active);

                outer.complete().await.unwrap();
                let uow = outer.unit_of_work().clone();
                outer.dispose().await.unwrap();
                assert_eq!(uow.state(), UnitOfWorkState::Disposed);
                assert!(manager.current().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_inner_complete_twice() {
        let manager = manager();
        AmbientContext::new()
            .scope(async {
                let outer = manager.begin_default().unwrap();
                let mut inner = manager.begin_default().unwrap();
                inner.complete().await.unwrap();
                assert!(matches!(
                    inner.complete().await,
                    Err(UowError::CompleteCalledTwice(_))
                ));
                inner.dispose().await.unwrap();
                outer.dispose().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_required_refuses_completed_current() {
        let manager = manager();
        AmbientContext::new()
            .scope(async {
                let mut outer = manager.begin_default().unwrap();
                outer.complete().await.unwrap();

                assert!(matches!(
                    manager.begin(UnitOfWorkOptions::required()),
                    Err(UowError::NotActive(_))
                ));
                outer.dispose().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_disposed_unit_of_work_is_not_current() {
        let manager = manager();
        AmbientContext::new()
            .scope(async {
                let outer = manager.begin_default().unwrap();
                // disposed behind the handle's back, its scope still open
                outer.unit_of_work().dispose().await.unwrap();
                assert!(manager.current().is_none());

                let mut fresh = manager.begin(UnitOfWorkOptions::required()).unwrap();
                assert!(fresh.is_root());
                assert!(!Arc::ptr_eq(fresh.unit_of_work(), outer.unit_of_work()));
                fresh.complete().await.unwrap();
                fresh.dispose().await.unwrap();
                outer.dispose().await.unwrap();
            })
            .await;
    }

    #[test]
    fn test_dropped_handle_disposes_without_runtime() {
        let manager = manager();
        AmbientContext::new().sync_scope(|| {
            let handle = manager.begin_default().unwrap();
            let uow = handle.unit_of_work().clone();
            drop(handle);

            assert!(manager.current().is_none());
            assert_eq!(uow.state(), UnitOfWorkState::Disposed);
        });
    }
}
