// ============================================================================
// Unit of Work Lifecycle
// ============================================================================
//
// State transitions:
//
//   Created ──construct──> Active ──complete──> Completed ──dispose──> Disposed
//                            │                                            ▲
//                            └──────────dispose without complete──> Failed ┘
//
// `complete` may only be attempted once, even if the attempt fails.
//
// ============================================================================

use crate::core::{Result, UowError};
use uuid::Uuid;

/// Unique identifier for a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitOfWorkId(Uuid);

impl UnitOfWorkId {
    pub fn new() -> Self {
        UnitOfWorkId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UnitOfWorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "uow_{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    Created,
    Active,
    Completed,
    Failed,
    Disposed,
}

impl UnitOfWorkState {
    pub fn is_active(&self) -> bool {
        matches!(self, UnitOfWorkState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitOfWorkState::Disposed)
    }
}

impl std::fmt::Display for UnitOfWorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitOfWorkState::Created => write!(f, "CREATED"),
            UnitOfWorkState::Active => write!(f, "ACTIVE"),
            UnitOfWorkState::Completed => write!(f, "COMPLETED"),
            UnitOfWorkState::Failed => write!(f, "FAILED"),
            UnitOfWorkState::Disposed => write!(f, "DISPOSED"),
        }
    }
}

/// Mutable lifecycle bookkeeping of one unit of work
#[derive(Debug)]
pub(crate) struct Lifecycle {
    id: UnitOfWorkId,
    state: UnitOfWorkState,
    complete_called: bool,
    rollback_only: bool,
    failure: Option<UowError>,
}

impl Lifecycle {
    pub(crate) fn new(id: UnitOfWorkId) -> Self {
        Self {
            id,
            state: UnitOfWorkState::Created,
            complete_called: false,
            rollback_only: false,
            failure: None,
        }
    }

    pub(crate) fn state(&self) -> UnitOfWorkState {
        self.state
    }

    pub(crate) fn activate(&mut self) {
        if self.state == UnitOfWorkState::Created {
            self.state = UnitOfWorkState::Active;
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(UowError::NotActive(format!("{} ({})", self.id, self.state)))
        }
    }

    /// Guard the single allowed `complete` attempt
    pub(crate) fn begin_complete(&mut self) -> Result<()> {
        if self.complete_called {
            return Err(UowError::CompleteCalledTwice(self.id.to_string()));
        }
        self.ensure_active()?;
        self.complete_called = true;

        if self.rollback_only {
            let err = self.failure.clone().unwrap_or(UowError::InnerNotCompleted);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn mark_completed(&mut self) {
        self.state = UnitOfWorkState::Completed;
    }

    pub(crate) fn record_failure(&mut self, error: UowError) {
        self.failure.get_or_insert(error);
    }

    pub(crate) fn mark_rollback_only(&mut self, error: UowError) {
        self.rollback_only = true;
        self.record_failure(error);
    }

    pub(crate) fn failure(&self) -> Option<&UowError> {
        self.failure.as_ref()
    }

    /// Start disposal; `None` when already disposed, else whether it completed
    pub(crate) fn begin_dispose(&mut self) -> Option<bool> {
        match self.state {
            UnitOfWorkState::Disposed => None,
            UnitOfWorkState::Completed => Some(true),
            _ => {
                self.state = UnitOfWorkState::Failed;
                Some(false)
            }
        }
    }

    pub(crate) fn mark_disposed(&mut self) {
        self.state = UnitOfWorkState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> Lifecycle {
        let mut lifecycle = Lifecycle::new(UnitOfWorkId::new());
        lifecycle.activate();
        lifecycle
    }

    #[test]
    fn test_id_generation() {
        let a = UnitOfWorkId::new();
        let b = UnitOfWorkId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("uow_"));
    }

    #[test]
    fn test_complete_lifecycle() {
        let mut lifecycle = active();
        assert!(lifecycle.state().is_active());
        lifecycle.begin_complete().unwrap();
        lifecycle.mark_completed();
        assert_eq!(lifecycle.begin_dispose(), Some(true));
        lifecycle.mark_disposed();
        assert!(lifecycle.state().is_terminal());
        assert_eq!(lifecycle.begin_dispose(), None);
    }

    #[test]
    fn test_cannot_complete_twice() {
        let mut lifecycle = active();
        lifecycle.begin_complete().unwrap();
        assert!(matches!(
            lifecycle.begin_complete(),
            Err(UowError::CompleteCalledTwice(_))
        ));
    }

    #[test]
    fn test_second_complete_fails_even_after_failed_attempt() {
        let mut lifecycle = active();
        lifecycle.begin_complete().unwrap();
        lifecycle.record_failure(UowError::Concurrency("row".into()));
        assert!(matches!(
            lifecycle.begin_complete(),
            Err(UowError::CompleteCalledTwice(_))
        ));
    }

    #[test]
    fn test_dispose_without_complete_fails() {
        let mut lifecycle = active();
        assert_eq!(lifecycle.begin_dispose(), Some(false));
        assert_eq!(lifecycle.state(), UnitOfWorkState::Failed);
    }

    #[test]
    fn test_rollback_only_blocks_complete() {
        let mut lifecycle = active();
        lifecycle.mark_rollback_only(UowError::InnerNotCompleted);
        assert_eq!(lifecycle.begin_complete(), Err(UowError::InnerNotCompleted));
    }
}
