use super::{
    COMPANY_ID_KEY, CONNECTION_STRING_NAME_KEY, ConnectionResolveArgs, ConnectionStringResolver,
    MultiTenancySide,
};
use crate::core::{Result, UowError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Connection string configuration
///
/// Named strings are picked explicitly through the `ConnectionStringName`
/// extra key; per-company strings serve tenant-side sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionStringsConfig {
    /// Used when nothing more specific applies
    pub default: String,

    /// Connection strings selectable by name
    pub named: HashMap<String, String>,

    /// Dedicated databases of individual companies
    pub per_company: HashMap<i32, String>,
}

impl ConnectionStringsConfig {
    /// Create a configuration with only a default connection string
    pub fn new(default: &str) -> Self {
        Self {
            default: default.to_string(),
            ..Self::default()
        }
    }

    /// Add a named connection string
    pub fn named(mut self, name: &str, connection_string: &str) -> Self {
        self.named
            .insert(name.to_string(), connection_string.to_string());
        self
    }

    /// Give a company its own database
    pub fn company(mut self, company_id: i32, connection_string: &str) -> Self {
        self.per_company
            .insert(company_id, connection_string.to_string());
        self
    }

    /// Parse from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| UowError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default.is_empty() {
            return Err(UowError::Configuration(
                "default connection string cannot be empty".into(),
            ));
        }
        if let Some(name) = self.named.iter().find(|(_, s)| s.is_empty()).map(|(n, _)| n) {
            return Err(UowError::Configuration(format!(
                "connection string '{}' cannot be empty",
                name
            )));
        }
        if self.per_company.contains_key(&0) {
            return Err(UowError::InvalidCompanyId(
                "0 is not a valid company id".into(),
            ));
        }
        Ok(())
    }
}

/// Resolves connection strings from a [`ConnectionStringsConfig`]
#[derive(Debug, Clone)]
pub struct DefaultConnectionStringResolver {
    config: ConnectionStringsConfig,
}

impl DefaultConnectionStringResolver {
    pub fn new(config: ConnectionStringsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectionStringsConfig {
        &self.config
    }

    fn select(&self, args: &ConnectionResolveArgs) -> Result<String> {
        if let Some(name) = args.extra(CONNECTION_STRING_NAME_KEY) {
            let name = name.as_str().ok_or_else(|| {
                UowError::Configuration(format!("{} must be a string", CONNECTION_STRING_NAME_KEY))
            })?;
            return self.config.named.get(name).cloned().ok_or_else(|| {
                UowError::Configuration(format!("Unknown connection string name '{}'", name))
            });
        }

        if args.multi_tenancy_side == Some(MultiTenancySide::Tenant) {
            let company = args
                .extra(COMPANY_ID_KEY)
                .and_then(serde_json::Value::as_i64)
                .and_then(|id| i32::try_from(id).ok());
            if let Some(connection_string) = company.and_then(|id| self.config.per_company.get(&id))
            {
                return Ok(connection_string.clone());
            }
        }

        if self.config.default.is_empty() {
            return Err(UowError::Configuration(
                "No default connection string configured".into(),
            ));
        }
        Ok(self.config.default.clone())
    }
}

#[async_trait]
impl ConnectionStringResolver for DefaultConnectionStringResolver {
    async fn resolve(&self, args: &ConnectionResolveArgs) -> Result<String> {
        self.select(args)
    }
}
