use super::entity::{Entity, Tenancy};
use crate::filter::{DataFilterConfiguration, DataFilters, FilterExecutor, FilterParameters};
use serde_json::Value as JsonValue;

/// Applies the standard filters to memory rows
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFilterExecutor;

fn enabled<'a>(
    filters: &'a [DataFilterConfiguration],
    name: &str,
) -> Option<&'a DataFilterConfiguration> {
    filters.iter().find(|f| f.name == name && f.is_enabled)
}

fn company_parameter(filter: &DataFilterConfiguration) -> Option<i32> {
    filter
        .parameter(FilterParameters::COMPANY_ID)
        .and_then(JsonValue::as_i64)
        .and_then(|id| i32::try_from(id).ok())
}

impl FilterExecutor for MemoryFilterExecutor {
    type Row = Entity;

    fn is_visible(&self, filters: &[DataFilterConfiguration], row: &Entity) -> bool {
        if row.soft_delete {
            if let Some(filter) = enabled(filters, DataFilters::SOFT_DELETE) {
                let wanted = filter
                    .parameter(FilterParameters::IS_DELETED)
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false);
                if row.is_deleted != wanted {
                    return false;
                }
            }
        }

        let company_filter = match row.tenancy {
            Tenancy::None => None,
            Tenancy::MustHave => enabled(filters, DataFilters::MUST_HAVE_COMPANY),
            Tenancy::MayHave => enabled(filters, DataFilters::MAY_HAVE_COMPANY),
        };
        match company_filter {
            Some(filter) => row.company_id == company_parameter(filter),
            None => true,
        }
    }
}
