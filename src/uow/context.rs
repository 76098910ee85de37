// ============================================================================
// Unit of Work Context
// ============================================================================
//
// Filter, company and audit state owned by one unit of work. Sessions receive
// a clone of the context when they are created, so the store side reads the
// same live configuration the application code is overriding.
//
// Every override returns a `RestoreGuard`; guards must be released in LIFO
// order. Only the owning unit of work mutates this state.
//
// ============================================================================

use super::state::UnitOfWorkId;
use crate::core::{RestoreGuard, Result, UowError, lock};
use crate::filter::{
    AuditFieldConfiguration, AuditRegistry, DataFilterConfiguration, DataFilters,
    FilterParameters, FilterRegistry,
};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use tracing::error;

struct ContextInner {
    id: UnitOfWorkId,
    user_id: Option<i64>,
    company_id: Mutex<Option<i32>>,
    filters: Mutex<FilterRegistry>,
    auditing: Mutex<AuditRegistry>,
}

/// Cheap to clone; every clone reads and writes the same state
#[derive(Clone)]
pub struct UnitOfWorkContext {
    inner: Arc<ContextInner>,
}

impl UnitOfWorkContext {
    /// Fresh context seeded with `filters` and `auditing`; no company is set
    pub fn new(
        id: UnitOfWorkId,
        filters: FilterRegistry,
        auditing: AuditRegistry,
        user_id: Option<i64>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                user_id,
                company_id: Mutex::new(None),
                filters: Mutex::new(filters),
                auditing: Mutex::new(auditing),
            }),
        }
    }

    /// Id of the owning unit of work
    pub fn id(&self) -> UnitOfWorkId {
        self.inner.id
    }

    /// User stamped into audit fields
    pub fn user_id(&self) -> Option<i64> {
        self.inner.user_id
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Whether the filter `name` is currently on
    ///
    /// # Errors
    /// `UnknownFilter` when no filter `name` was seeded.
    pub fn is_filter_enabled(&self, name: &str) -> Result<bool> {
        lock(&self.inner.filters).is_enabled(name)
    }

    /// Snapshot of one filter
    pub fn filter(&self, name: &str) -> Result<DataFilterConfiguration> {
        lock(&self.inner.filters).get(name).cloned()
    }

    /// Current configuration of every filter
    pub fn filters(&self) -> Vec<DataFilterConfiguration> {
        lock(&self.inner.filters).snapshot()
    }

    /// Current value of one filter parameter; `None` when it was never set
    pub fn filter_parameter(&self, filter: &str, parameter: &str) -> Result<Option<JsonValue>> {
        lock(&self.inner.filters).parameter(filter, parameter)
    }

    /// Turn the named filters off until the guard is released.
    ///
    /// Names already off are left alone and are not touched on release, so
    /// nested calls restore exactly what they changed. An unknown name fails
    /// the whole call before anything changes.
    pub fn disable_filter(&self, names: &[&str]) -> Result<RestoreGuard> {
        self.switch_filters(names, false)
    }

    /// Turn the named filters on until the guard is released
    pub fn enable_filter(&self, names: &[&str]) -> Result<RestoreGuard> {
        self.switch_filters(names, true)
    }

    fn switch_filters(&self, names: &[&str], enabled: bool) -> Result<RestoreGuard> {
        let mut filters = lock(&self.inner.filters);
        // validate everything first so a bad name leaves the state untouched
        for name in names {
            filters.get(name)?;
        }

        let mut changed = Vec::new();
        for name in names {
            if filters.set_enabled(name, enabled)? != enabled {
                changed.push(name.to_string());
            }
        }

        if changed.is_empty() {
            return Ok(RestoreGuard::noop());
        }

        let inner = self.inner.clone();
        Ok(RestoreGuard::new(move || {
            let mut filters = lock(&inner.filters);
            for name in &changed {
                if let Err(err) = filters.set_enabled(name, !enabled) {
                    error!(filter = %name, "Failed to restore filter state: {}", err);
                }
            }
        }))
    }

    /// Override one filter parameter until the guard is released.
    ///
    /// On release the parameter gets its previous value back, or is removed
    /// if it had none.
    pub fn set_filter_parameter(
        &self,
        filter: &str,
        parameter: &str,
        value: impl Into<JsonValue>,
    ) -> Result<RestoreGuard> {
        let value = value.into();
        let previous = {
            let mut filters = lock(&self.inner.filters);
            let current = filters.parameter(filter, parameter)?;
            if current.as_ref() == Some(&value) {
                return Ok(RestoreGuard::noop());
            }
            filters.set_parameter(filter, parameter, value)?
        };

        let inner = self.inner.clone();
        let filter = filter.to_string();
        let parameter = parameter.to_string();
        Ok(RestoreGuard::new(move || {
            let mut filters = lock(&inner.filters);
            if let Err(err) = filters.restore_parameter(&filter, &parameter, previous) {
                error!(filter = %filter, parameter = %parameter, "Failed to restore filter parameter: {}", err);
            }
        }))
    }

    // ------------------------------------------------------------------
    // Company
    // ------------------------------------------------------------------

    /// Company the unit of work currently acts for; `None` is the host
    pub fn company_id(&self) -> Option<i32> {
        *lock(&self.inner.company_id)
    }

    /// Act for `company_id` until the guard is released.
    ///
    /// Updates the company parameter of both company filters. With
    /// `switch_required_filter`, the must-have filter is enabled for a company
    /// and disabled for the host (`None`), so host code sees every company's
    /// rows.
    ///
    /// # Errors
    /// `InvalidCompanyId` for `Some(0)`: zero is never a valid company.
    pub fn set_company_id(
        &self,
        company_id: Option<i32>,
        switch_required_filter: bool,
    ) -> Result<RestoreGuard> {
        if company_id == Some(0) {
            return Err(UowError::InvalidCompanyId(
                "0 is not a valid company id; use None for the host".into(),
            ));
        }

        let parameter = company_id.map_or(JsonValue::Null, JsonValue::from);
        let must_have_switch = match (switch_required_filter, company_id) {
            (false, _) => RestoreGuard::noop(),
            (true, Some(_)) => self.enable_filter(&[DataFilters::MUST_HAVE_COMPANY])?,
            (true, None) => self.disable_filter(&[DataFilters::MUST_HAVE_COMPANY])?,
        };
        let may_have_parameter = self.set_filter_parameter(
            DataFilters::MAY_HAVE_COMPANY,
            FilterParameters::COMPANY_ID,
            parameter.clone(),
        )?;
        let must_have_parameter = self.set_filter_parameter(
            DataFilters::MUST_HAVE_COMPANY,
            FilterParameters::COMPANY_ID,
            parameter,
        )?;

        let previous = std::mem::replace(&mut *lock(&self.inner.company_id), company_id);

        let inner = self.inner.clone();
        let restore_id = RestoreGuard::new(move || {
            *lock(&inner.company_id) = previous;
        });
        Ok(RestoreGuard::chain(vec![
            must_have_switch,
            may_have_parameter,
            must_have_parameter,
            restore_id,
        ]))
    }

    // ------------------------------------------------------------------
    // Auditing
    // ------------------------------------------------------------------

    /// Whether `field_name` is stamped on save
    pub fn is_auditing_enabled(&self, field_name: &str) -> Result<bool> {
        lock(&self.inner.auditing).is_enabled(field_name)
    }

    /// Current configuration of every audit field
    pub fn audit_fields(&self) -> Vec<AuditFieldConfiguration> {
        lock(&self.inner.auditing).snapshot()
    }

    /// Stop stamping the named audit fields until the guard is released
    pub fn disable_auditing(&self, field_names: &[&str]) -> Result<RestoreGuard> {
        self.switch_auditing(field_names, false)
    }

    /// Stamp the named audit fields until the guard is released
    pub fn enable_auditing(&self, field_names: &[&str]) -> Result<RestoreGuard> {
        self.switch_auditing(field_names, true)
    }

    fn switch_auditing(&self, field_names: &[&str], enabled: bool) -> Result<RestoreGuard> {
        let mut auditing = lock(&self.inner.auditing);
        for name in field_names {
            auditing.is_enabled(name)?;
        }

        let mut changed = Vec::new();
        for name in field_names {
            if auditing.set_enabled(name, enabled)? != enabled {
                changed.push(name.to_string());
            }
        }

        if changed.is_empty() {
            return Ok(RestoreGuard::noop());
        }

        let inner = self.inner.clone();
        Ok(RestoreGuard::new(move || {
            let mut auditing = lock(&inner.auditing);
            for name in &changed {
                if let Err(err) = auditing.set_enabled(name, !enabled) {
                    error!(field = %name, "Failed to restore audit state: {}", err);
                }
            }
        }))
    }
}

impl std::fmt::Debug for UnitOfWorkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkContext")
            .field("id", &self.inner.id)
            .field("company_id", &self.company_id())
            .field("user_id", &self.inner.user_id)
            .finish()
    }
}
