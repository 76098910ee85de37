use crate::filter::{
    AuditFieldConfiguration, DataFilterConfiguration, standard_audit_fields, standard_filters,
};
use crate::store::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How `begin` relates to an ambient unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionScopeOption {
    /// Join the ambient unit of work, or start one if there is none.
    #[default]
    Required,
    /// Always start an independent unit of work.
    RequiresNew,
    /// Always start an independent, non-transactional unit of work.
    Suppress,
}

/// Options for one unit of work
///
/// `None` fields are filled from [`UnitOfWorkDefaultOptions`] when the unit of
/// work begins; after that the options are fixed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWorkOptions {
    pub scope: Option<TransactionScopeOption>,
    pub is_transactional: Option<bool>,
    pub timeout: Option<Duration>,
    pub isolation_level: Option<IsolationLevel>,
    pub filter_overrides: Vec<DataFilterConfiguration>,
}

impl UnitOfWorkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required() -> Self {
        Self::new().scope(TransactionScopeOption::Required)
    }

    pub fn requires_new() -> Self {
        Self::new().scope(TransactionScopeOption::RequiresNew)
    }

    pub fn suppress() -> Self {
        Self::new().scope(TransactionScopeOption::Suppress)
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

    pub fn filter_override(mut self, filter: DataFilterConfiguration) -> Self {
        self.filter_overrides.push(filter);
        self
    }

    pub fn scope_option(&self) -> TransactionScopeOption {
        self.scope.unwrap_or_default()
    }

    /// Suppressed units of work never open transactions
    pub fn is_transactional(&self) -> bool {
        self.scope_option() != TransactionScopeOption::Suppress
            && self.is_transactional.unwrap_or(true)
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation_level.unwrap_or_default()
    }
}

/// Defaults applied to every `begin`
///
/// Passed to `UnitOfWorkManager::new`; there is no process-wide mutable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkDefaultOptions {
    pub scope: TransactionScopeOption,
    pub is_transactional: bool,
    pub timeout: Option<Duration>,
    pub isolation_level: IsolationLevel,
    pub filters: Vec<DataFilterConfiguration>,
    pub audit_fields: Vec<AuditFieldConfiguration>,
}

impl UnitOfWorkDefaultOptions {
    pub fn new() -> Self {
        Self {
            scope: TransactionScopeOption::Required,
            is_transactional: true,
            timeout: None,
            isolation_level: IsolationLevel::ReadCommitted,
            filters: standard_filters(),
            audit_fields: standard_audit_fields(),
        }
    }

    /// Parse from a JSON document; absent fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, String> {
        let options: Self = serde_json::from_str(json).map_err(|e| e.to_string())?;
        options.validate()?;
        Ok(options)
    }

    pub fn scope(mut self, scope: TransactionScopeOption) -> Self {
        self.scope = scope;
        self
    }

    pub fn transactional(mut self, is_transactional: bool) -> Self {
        self.is_transactional = is_transactional;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Register a filter, replacing any default with the same name
    pub fn filter(mut self, filter: DataFilterConfiguration) -> Self {
        self.filters.retain(|f| f.name != filter.name);
        self.filters.push(filter);
        self
    }

    pub fn audit_field(mut self, field: AuditFieldConfiguration) -> Self {
        self.audit_fields.retain(|f| f.field_name != field.field_name);
        self.audit_fields.push(field);
        self
    }

    /// Fill every unset field of `options`
    pub fn apply_to(&self, options: &mut UnitOfWorkOptions) {
        options.scope.get_or_insert(self.scope);
        options.is_transactional.get_or_insert(self.is_transactional);
        options.isolation_level.get_or_insert(self.isolation_level);
        if options.timeout.is_none() {
            options.timeout = self.timeout;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeout == Some(Duration::ZERO) {
            return Err("timeout must be greater than zero".to_string());
        }

        let mut names: Vec<&str> = self.filters.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err("filter names must be unique".to_string());
        }
        if names.iter().any(|name| name.is_empty()) {
            return Err("filter names cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for UnitOfWorkDefaultOptions {
    fn default() -> Self {
        Self::new()
    }
}
