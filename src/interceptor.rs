// ============================================================================
// Unit of Work Interception
// ============================================================================
//
// Wraps an operation in a unit of work according to a declared policy:
//
//   begin -> proceed -> complete -> dispose      (operation succeeded)
//   begin -> proceed -> fail     -> dispose      (operation failed)
//
// The operation's own error is returned unchanged once disposal has run.
// Without a policy, or with a disabled one, the operation runs untouched.
//
// Each interception runs on its own ambient branch: a nested call still sees
// the caller's unit of work, but concurrent intercepted calls never see each
// other's.
//
// ============================================================================

use crate::ambient::AmbientContext;
use crate::core::{Result as UowResult, UowError, lock};
use crate::store::IsolationLevel;
use crate::uow::{TransactionScopeOption, UnitOfWorkHandle, UnitOfWorkManager, UnitOfWorkOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Unit of work policy declared for an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkPolicy {
    pub scope: Option<TransactionScopeOption>,
    pub is_transactional: Option<bool>,
    pub timeout: Option<Duration>,
    pub isolation_level: Option<IsolationLevel>,
    pub is_disabled: bool,
}

impl UnitOfWorkPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicitly opt an operation out of interception
    pub fn disabled() -> Self {
        Self {
            is_disabled: true,
            ..Self::default()
        }
    }

    pub fn scope(mut self, scope: TransactionScopeOption) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn transactional(mut self, is_transactional: bool) -> Self {
        self.is_transactional = Some(is_transactional);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn to_options(&self) -> UnitOfWorkOptions {
        UnitOfWorkOptions {
            scope: self.scope,
            is_transactional: self.is_transactional,
            timeout: self.timeout,
            isolation_level: self.isolation_level,
            filter_overrides: Vec::new(),
        }
    }
}

pub struct UnitOfWorkInterceptor {
    manager: Arc<UnitOfWorkManager>,
    policies: Mutex<HashMap<String, UnitOfWorkPolicy>>,
}

impl UnitOfWorkInterceptor {
    pub fn new(manager: Arc<UnitOfWorkManager>) -> Self {
        Self {
            manager,
            policies: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<UnitOfWorkManager> {
        &self.manager
    }

    /// Declare the policy of `operation`, replacing any earlier one
    pub fn register(&self, operation: &str, policy: UnitOfWorkPolicy) {
        lock(&self.policies).insert(operation.to_string(), policy);
    }

    pub fn policy_for(&self, operation: &str) -> Option<UnitOfWorkPolicy> {
        lock(&self.policies).get(operation).cloned()
    }

    /// Run `proceed` under the policy registered for `operation`
    pub async fn intercept_named<F, Fut, T, E>(&self, operation: &str, proceed: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<UowError> + Display,
    {
        let policy = self.policy_for(operation);
        self.intercept(policy.as_ref(), proceed).await
    }

    /// Run `proceed` inside a unit of work shaped by `policy`
    pub async fn intercept<F, Fut, T, E>(
        &self,
        policy: Option<&UnitOfWorkPolicy>,
        proceed: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<UowError> + Display,
    {
        let Some(policy) = policy.filter(|p| !p.is_disabled) else {
            return proceed().await;
        };
        let options = policy.to_options();
        AmbientContext::branch(self.run_async(options, proceed)).await
    }

    async fn run_async<F, Fut, T, E>(&self, options: UnitOfWorkOptions, proceed: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<UowError> + Display,
    {
        let mut handle = self.manager.begin(options)?;

        match proceed().await {
            Ok(value) => {
                if let Err(err) = handle.complete().await {
                    log_dispose(handle.dispose().await);
                    return Err(err.into());
                }
                handle.dispose().await?;
                Ok(value)
            }
            Err(err) => {
                handle.fail(UowError::Operation(err.to_string()));
                log_dispose(handle.dispose().await);
                Err(err)
            }
        }
    }

    /// Blocking counterpart of [`UnitOfWorkInterceptor::intercept`]
    pub fn intercept_blocking<F, T, E>(
        &self,
        policy: Option<&UnitOfWorkPolicy>,
        proceed: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<UowError> + Display,
    {
        let Some(policy) = policy.filter(|p| !p.is_disabled) else {
            return proceed();
        };
        let options = policy.to_options();
        AmbientContext::branch_blocking(|| {
            let mut handle = self.manager.begin(options)?;
            match proceed() {
                Ok(value) => {
                    if let Err(err) = handle.complete_blocking() {
                        log_dispose(handle.dispose_blocking());
                        return Err(err.into());
                    }
                    handle.dispose_blocking()?;
                    Ok(value)
                }
                Err(err) => {
                    handle.fail(UowError::Operation(err.to_string()));
                    log_dispose(handle.dispose_blocking());
                    Err(err)
                }
            }
        })
    }

    /// Begin a unit of work by hand, for call sites that cannot be wrapped
    pub fn begin(&self, policy: &UnitOfWorkPolicy) -> UowResult<UnitOfWorkHandle> {
        self.manager.begin(policy.to_options())
    }
}

/// Disposal errors after a failed operation or a failed complete are logged;
/// the first error is the one reported to the caller.
fn log_dispose(result: UowResult<()>) {
    match result {
        Ok(()) => {}
        Err(UowError::InnerNotCompleted) => {
            debug!("Joined unit of work marked rollback-only");
        }
        Err(err) => warn!("Dispose after failure reported: {}", err),
    }
}

impl std::fmt::Debug for UnitOfWorkInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let operations: Vec<String> = lock(&self.policies).keys().cloned().collect();
        f.debug_struct("UnitOfWorkInterceptor")
            .field("operations", &operations)
            .finish()
    }
}
