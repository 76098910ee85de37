use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How an entity belongs to a company
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Tenancy {
    /// Shared by every company.
    #[default]
    None,
    /// Always owned by exactly one company.
    MustHave,
    /// Owned by one company, or by the host when `company_id` is `None`.
    MayHave,
}

/// A row of the in-memory store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Assigned by `MemorySession::insert`
    pub id: u64,
    pub company_id: Option<i32>,
    pub tenancy: Tenancy,
    pub soft_delete: bool,
    pub is_deleted: bool,
    /// Optimistic concurrency token, bumped on every committed write
    pub version: u64,
    pub creator_user_id: Option<i64>,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_modifier_user_id: Option<i64>,
    pub last_modification_time: Option<DateTime<Utc>>,
    pub deleter_user_id: Option<i64>,
    pub deletion_time: Option<DateTime<Utc>>,
    pub data: JsonValue,
}

impl Entity {
    pub fn new(data: JsonValue) -> Self {
        Self {
            id: 0,
            company_id: None,
            tenancy: Tenancy::None,
            soft_delete: false,
            is_deleted: false,
            version: 0,
            creator_user_id: None,
            creation_time: None,
            last_modifier_user_id: None,
            last_modification_time: None,
            deleter_user_id: None,
            deletion_time: None,
            data,
        }
    }

    pub fn must_have_company(mut self) -> Self {
        self.tenancy = Tenancy::MustHave;
        self
    }

    pub fn may_have_company(mut self) -> Self {
        self.tenancy = Tenancy::MayHave;
        self
    }

    pub fn company(mut self, company_id: i32) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.data.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<JsonValue>) {
        if let JsonValue::Object(map) = &mut self.data {
            map.insert(field.to_string(), value.into());
        }
    }
}
