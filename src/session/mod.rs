// ============================================================================
// Ambient Session (run-as)
// ============================================================================
//
// Resolves the company and user the current call chain acts for. The value
// comes from an `IdentitySource` (the security context) unless a run-as
// override has been pushed on the ambient stack.
//
// ============================================================================

use crate::ambient::{AmbientScopeStack, ScopeHandle};
use crate::core::{Result, UowError};
use std::sync::Arc;

static SESSION_OVERRIDES: AmbientScopeStack<SessionOverride> =
    AmbientScopeStack::new("session");

const OVERRIDE_KEY: &str = "override";

/// Company/user pair pushed by run-as operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOverride {
    pub company_id: Option<i32>,
    pub user_id: Option<i64>,
}

impl SessionOverride {
    pub fn new(company_id: Option<i32>, user_id: Option<i64>) -> Self {
        Self {
            company_id,
            user_id,
        }
    }
}

/// Where the authenticated company and user come from
pub trait IdentitySource: Send + Sync {
    fn company_id(&self) -> Option<i32>;
    fn user_id(&self) -> Option<i64>;
}

/// Fixed identity, e.g. for background work or tests
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticIdentity {
    pub company_id: Option<i32>,
    pub user_id: Option<i64>,
}

impl StaticIdentity {
    /// Host-side, anonymous identity
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new(company_id: Option<i32>, user_id: Option<i64>) -> Self {
        Self {
            company_id,
            user_id,
        }
    }
}

impl IdentitySource for StaticIdentity {
    fn company_id(&self) -> Option<i32> {
        self.company_id
    }

    fn user_id(&self) -> Option<i64> {
        self.user_id
    }
}

#[derive(Clone)]
pub struct AmbientSession {
    identity: Arc<dyn IdentitySource>,
}

impl AmbientSession {
    pub fn new(identity: Arc<dyn IdentitySource>) -> Self {
        Self { identity }
    }

    pub fn anonymous() -> Self {
        Self::new(Arc::new(StaticIdentity::anonymous()))
    }

    /// The active override, if a run-as scope is open on this call chain
    pub fn current_override(&self) -> Option<SessionOverride> {
        SESSION_OVERRIDES.get_value(OVERRIDE_KEY)
    }

    pub fn company_id(&self) -> Option<i32> {
        match self.current_override() {
            Some(over) => over.company_id,
            None => self.identity.company_id(),
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self.current_override() {
            Some(over) => over.user_id,
            None => self.identity.user_id(),
        }
    }

    /// Act as `company_id`/`user_id` until the returned handle is released
    ///
    /// # Errors
    /// `InvalidCompanyId` for company id 0, `NoAmbientContext` when no call
    /// chain root is installed.
    pub fn use_override(&self, company_id: Option<i32>, user_id: Option<i64>) -> Result<ScopeHandle> {
        if company_id == Some(0) {
            return Err(UowError::InvalidCompanyId(
                "0 is not a valid company id; use None for the host".into(),
            ));
        }
        SESSION_OVERRIDES.begin_scope(OVERRIDE_KEY, SessionOverride::new(company_id, user_id))
    }
}

impl Default for AmbientSession {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl std::fmt::Debug for AmbientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientSession")
            .field("company_id", &self.company_id())
            .field("user_id", &self.user_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::AmbientContext;

    #[test]
    fn test_identity_without_override() {
        let session = AmbientSession::new(Arc::new(StaticIdentity::new(Some(3), Some(30))));
        assert_eq!(session.company_id(), Some(3));
        assert_eq!(session.user_id(), Some(30));
    }

    #[test]
    fn test_override_and_restore() {
        let session = AmbientSession::new(Arc::new(StaticIdentity::new(Some(3), Some(30))));
        AmbientContext::new().sync_scope(|| {
            let host = session.use_override(None, Some(1)).unwrap();
            assert_eq!(session.company_id(), None);
            assert_eq!(session.user_id(), Some(1));
            {
                let _tenant = session.use_override(Some(8), None).unwrap();
                assert_eq!(session.company_id(), Some(8));
            }
            assert_eq!(session.company_id(), None);
            host.release().unwrap();
            assert_eq!(session.company_id(), Some(3));
        });
    }

    #[test]
    fn test_zero_company_rejected() {
        let session = AmbientSession::anonymous();
        AmbientContext::new().sync_scope(|| {
            assert!(matches!(
                session.use_override(Some(0), None),
                Err(UowError::InvalidCompanyId(_))
            ));
        });
    }
}
