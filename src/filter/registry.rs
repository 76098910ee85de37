use crate::core::{Result, UowError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// One named filter: on/off switch plus its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFilterConfiguration {
    pub name: String,
    pub is_enabled: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, JsonValue>,
}

impl DataFilterConfiguration {
    pub fn new(name: &str, is_enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            is_enabled,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&JsonValue> {
        self.parameters.get(name)
    }
}

/// Per-unit-of-work filter state.
///
/// Filters are seeded once and afterwards only toggled or re-parameterized;
/// a name that was not seeded is rejected with `UnknownFilter`.
#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    filters: BTreeMap<String, DataFilterConfiguration>,
}

impl FilterRegistry {
    pub fn new(defaults: &[DataFilterConfiguration]) -> Self {
        let filters = defaults
            .iter()
            .map(|filter| (filter.name.clone(), filter.clone()))
            .collect();
        Self { filters }
    }

    /// Overlay `overrides` onto seeded filters; unknown names are added
    pub fn apply_overrides(&mut self, overrides: &[DataFilterConfiguration]) {
        for filter in overrides {
            match self.filters.get_mut(&filter.name) {
                Some(existing) => {
                    existing.is_enabled = filter.is_enabled;
                    existing
                        .parameters
                        .extend(filter.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                None => {
                    self.filters.insert(filter.name.clone(), filter.clone());
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<&DataFilterConfiguration> {
        self.filters
            .get(name)
            .ok_or_else(|| UowError::UnknownFilter(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut DataFilterConfiguration> {
        self.filters
            .get_mut(name)
            .ok_or_else(|| UowError::UnknownFilter(name.to_string()))
    }

    pub fn is_enabled(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_enabled)
    }

    /// Set the enabled flag and return the previous one
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<bool> {
        let filter = self.get_mut(name)?;
        let previous = filter.is_enabled;
        filter.is_enabled = enabled;
        Ok(previous)
    }

    pub fn parameter(&self, filter: &str, parameter: &str) -> Result<Option<JsonValue>> {
        Ok(self.get(filter)?.parameters.get(parameter).cloned())
    }

    /// Set a parameter and return its previous value (`None` when it was absent)
    pub fn set_parameter(
        &mut self,
        filter: &str,
        parameter: &str,
        value: JsonValue,
    ) -> Result<Option<JsonValue>> {
        let filter = self.get_mut(filter)?;
        Ok(filter.parameters.insert(parameter.to_string(), value))
    }

    /// Put back a value captured by [`FilterRegistry::set_parameter`]
    pub fn restore_parameter(
        &mut self,
        filter: &str,
        parameter: &str,
        previous: Option<JsonValue>,
    ) -> Result<()> {
        let filter = self.get_mut(filter)?;
        match previous {
            Some(value) => {
                filter.parameters.insert(parameter.to_string(), value);
            }
            None => {
                filter.parameters.remove(parameter);
            }
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    /// Copy of every filter, for handing to a `FilterExecutor`
    pub fn snapshot(&self) -> Vec<DataFilterConfiguration> {
        self.filters.values().cloned().collect()
    }
}
