// ============================================================================
// Change Tracking
// ============================================================================
//
// A session records writes as `Change` commands. Saving hands them to the
// session's transaction (pending until commit) or, without a transaction,
// straight to the database.
//
// ============================================================================

use super::entity::Entity;
use crate::core::{Result, UowError};
use std::collections::BTreeMap;

/// A single tracked write
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert {
        table: String,
        entity: Entity,
    },

    /// `entity.version` is the version the caller read
    Update {
        table: String,
        entity: Entity,
    },

    /// Removes the row; soft-deletable entities are turned into an
    /// `Update` before they get here
    Delete {
        table: String,
        entity: Entity,
    },
}

impl Change {
    pub fn table_name(&self) -> &str {
        match self {
            Change::Insert { table, .. } => table,
            Change::Update { table, .. } => table,
            Change::Delete { table, .. } => table,
        }
    }

    pub fn entity(&self) -> &Entity {
        match self {
            Change::Insert { entity, .. } => entity,
            Change::Update { entity, .. } => entity,
            Change::Delete { entity, .. } => entity,
        }
    }

    /// Check that `rows` still matches what this change was based on
    pub(crate) fn check(&self, rows: Option<&BTreeMap<u64, Entity>>) -> Result<()> {
        let stored = rows.and_then(|rows| rows.get(&self.entity().id));
        match self {
            Change::Insert { table, entity } => match stored {
                Some(_) => Err(UowError::Concurrency(format!(
                    "{}#{} already exists",
                    table, entity.id
                ))),
                None => Ok(()),
            },
            Change::Update { table, entity } | Change::Delete { table, entity } => match stored {
                Some(row) if row.version == entity.version => Ok(()),
                Some(row) => Err(UowError::Concurrency(format!(
                    "{}#{} was changed by someone else (version {} expected, found {})",
                    table, entity.id, entity.version, row.version
                ))),
                None => Err(UowError::Concurrency(format!(
                    "{}#{} no longer exists",
                    table, entity.id
                ))),
            },
        }
    }

    /// Apply to a table image without checking versions
    pub(crate) fn apply_to(&self, rows: &mut BTreeMap<u64, Entity>) {
        match self {
            Change::Insert { entity, .. } | Change::Update { entity, .. } => {
                let mut row = entity.clone();
                row.version += 1;
                rows.insert(row.id, row);
            }
            Change::Delete { entity, .. } => {
                rows.remove(&entity.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(version: u64) -> BTreeMap<u64, Entity> {
        let mut entity = Entity::new(json!({}));
        entity.id = 1;
        entity.version = version;
        BTreeMap::from([(1, entity)])
    }

    #[test]
    fn test_update_detects_stale_version() {
        let mut entity = Entity::new(json!({}));
        entity.id = 1;
        entity.version = 1;
        let change = Change::Update {
            table: "orders".into(),
            entity,
        };

        assert!(change.check(Some(&stored(1))).is_ok());
        assert!(matches!(
            change.check(Some(&stored(2))),
            Err(UowError::Concurrency(_))
        ));
        assert!(change.check(None).is_err());
    }

    #[test]
    fn test_apply_bumps_version() {
        let mut rows = BTreeMap::new();
        let mut entity = Entity::new(json!({}));
        entity.id = 5;
        Change::Insert {
            table: "orders".into(),
            entity,
        }
        .apply_to(&mut rows);
        assert_eq!(rows[&5].version, 1);
    }
}
