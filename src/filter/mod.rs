// ============================================================================
// Data Filters
// ============================================================================
//
// Named, toggleable query filters (soft delete, tenant isolation) and the
// audit-field stamping switches. This module only maintains configuration;
// turning a configuration into predicates is the job of a `FilterExecutor`
// on the store side.
//
// ============================================================================

pub mod audit;
pub mod registry;

pub use audit::{AuditFieldConfiguration, AuditRegistry};
pub use registry::{DataFilterConfiguration, FilterRegistry};

/// Standard filter names
pub struct DataFilters;

impl DataFilters {
    /// Hides rows whose deleted flag does not match the `isDeleted` parameter.
    pub const SOFT_DELETE: &'static str = "SoftDelete";

    /// Restricts company-owned rows to the `companyId` parameter.
    pub const MUST_HAVE_COMPANY: &'static str = "MustHaveCompany";

    /// Restricts optionally company-owned rows to the `companyId` parameter
    /// (a null parameter selects host rows).
    pub const MAY_HAVE_COMPANY: &'static str = "MayHaveCompany";
}

/// Standard filter parameter names
pub struct FilterParameters;

impl FilterParameters {
    pub const COMPANY_ID: &'static str = "companyId";
    pub const IS_DELETED: &'static str = "isDeleted";
}

/// Standard audit field names
pub struct AuditFields;

impl AuditFields {
    pub const CREATOR_USER_ID: &'static str = "CreatorUserId";
    pub const LAST_MODIFIER_USER_ID: &'static str = "LastModifierUserId";
    pub const LAST_MODIFICATION_TIME: &'static str = "LastModificationTime";
    pub const DELETER_USER_ID: &'static str = "DeleterUserId";
    pub const DELETION_TIME: &'static str = "DeletionTime";

    pub const ALL: [&'static str; 5] = [
        Self::CREATOR_USER_ID,
        Self::LAST_MODIFIER_USER_ID,
        Self::LAST_MODIFICATION_TIME,
        Self::DELETER_USER_ID,
        Self::DELETION_TIME,
    ];
}

/// The filter set every unit of work starts from unless configured otherwise
pub fn standard_filters() -> Vec<DataFilterConfiguration> {
    vec![
        DataFilterConfiguration::new(DataFilters::SOFT_DELETE, true)
            .with_parameter(FilterParameters::IS_DELETED, false),
        DataFilterConfiguration::new(DataFilters::MUST_HAVE_COMPANY, true)
            .with_parameter(FilterParameters::COMPANY_ID, serde_json::Value::Null),
        DataFilterConfiguration::new(DataFilters::MAY_HAVE_COMPANY, true)
            .with_parameter(FilterParameters::COMPANY_ID, serde_json::Value::Null),
    ]
}

/// Every standard audit field, saving enabled
pub fn standard_audit_fields() -> Vec<AuditFieldConfiguration> {
    AuditFields::ALL
        .iter()
        .map(|name| AuditFieldConfiguration::new(name, true))
        .collect()
}

/// Store-side consumer of filter configuration.
///
/// Implementations materialize the enabled filters as predicates over their
/// own row type. The unit of work never builds predicates itself.
pub trait FilterExecutor {
    type Row;

    /// Whether `row` is visible under `filters`
    fn is_visible(&self, filters: &[DataFilterConfiguration], row: &Self::Row) -> bool;

    /// Keep only the visible rows
    fn apply(&self, filters: &[DataFilterConfiguration], rows: Vec<Self::Row>) -> Vec<Self::Row> {
        rows.into_iter()
            .filter(|row| self.is_visible(filters, row))
            .collect()
    }
}
