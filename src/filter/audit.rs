use crate::core::{Result, UowError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether one audit field is stamped on save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFieldConfiguration {
    pub field_name: String,
    pub is_saving_enabled: bool,
}

impl AuditFieldConfiguration {
    pub fn new(field_name: &str, is_saving_enabled: bool) -> Self {
        Self {
            field_name: field_name.to_string(),
            is_saving_enabled,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditRegistry {
    fields: BTreeMap<String, bool>,
}

impl AuditRegistry {
    pub fn new(defaults: &[AuditFieldConfiguration]) -> Self {
        let fields = defaults
            .iter()
            .map(|field| (field.field_name.clone(), field.is_saving_enabled))
            .collect();
        Self { fields }
    }

    pub fn is_enabled(&self, field_name: &str) -> Result<bool> {
        self.fields
            .get(field_name)
            .copied()
            .ok_or_else(|| UowError::UnknownAuditField(field_name.to_string()))
    }

    /// Set the saving flag and return the previous one
    pub fn set_enabled(&mut self, field_name: &str, enabled: bool) -> Result<bool> {
        let flag = self
            .fields
            .get_mut(field_name)
            .ok_or_else(|| UowError::UnknownAuditField(field_name.to_string()))?;
        Ok(std::mem::replace(flag, enabled))
    }

    pub fn snapshot(&self) -> Vec<AuditFieldConfiguration> {
        self.fields
            .iter()
            .map(|(name, enabled)| AuditFieldConfiguration::new(name, *enabled))
            .collect()
    }
}
