//! Translation of primary-store ids into secondary-store ids.
//!
//! Surrogate ids are assigned independently by each store, so a foreign key
//! copied verbatim would point at an unrelated (or missing) secondary row.
//! The resolver follows the reference to the parent row in the primary,
//! extracts the parent's natural key and finds the row with the same key in
//! the secondary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tracing::trace;

use super::catalog;
use super::schema::TableMigrationSpec;
use super::traits::{Lookup, Store};
use super::value::{Row, SqlValue};
use crate::config::TimestampPrecision;
use crate::error::Result;

/// A reference whose secondary id differs from its primary id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rewritten {
    pub column: usize,
    pub parent: &'static str,
    pub primary_id: i64,
}

/// A primary row in secondary terms.
#[derive(Debug, Clone)]
pub struct Translation {
    pub row: Row,
    pub rewritten: Vec<Rewritten>,
}

impl Translation {
    /// Natural key the row was stored under if it was copied before its
    /// parents: rewritten key references still hold their primary ids.
    ///
    /// `None` when no natural key column was rewritten.
    pub fn forward_key(&self, spec: &TableMigrationSpec) -> Option<Vec<SqlValue>> {
        let indices = spec.natural_key_indices();
        let in_key: Vec<&Rewritten> = self
            .rewritten
            .iter()
            .filter(|r| indices.contains(&r.column))
            .collect();
        if in_key.is_empty() {
            return None;
        }

        let mut values = self.row.values.clone();
        for r in in_key {
            values[r.column] = SqlValue::Int(r.primary_id);
        }
        Some(Row::new(values).project(&indices))
    }
}

/// Maps primary ids to secondary ids by natural key.
///
/// Positive results are cached for the lifetime of the resolver. Misses are
/// not cached: the parent may be copied later in the same run.
pub struct IdResolver {
    primary: Arc<dyn Store>,
    secondary: Arc<dyn Store>,
    precision: TimestampPrecision,
    cache: Mutex<HashMap<(&'static str, i64), i64>>,
}

impl IdResolver {
    pub fn new(
        primary: Arc<dyn Store>,
        secondary: Arc<dyn Store>,
        precision: TimestampPrecision,
    ) -> Self {
        Self {
            primary,
            secondary,
            precision,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Secondary id of the row that `primary_id` identifies in `table`.
    ///
    /// `None` when the primary row does not exist or has no counterpart yet.
    pub fn resolve(&self, table: &'static str, primary_id: i64) -> BoxFuture<'_, Result<Option<i64>>> {
        async move {
            if let Some(id) = self.cached(table, primary_id) {
                return Ok(Some(id));
            }

            let spec = catalog::lookup(table)?;
            let Some(parent) = self.primary.find_row(spec, Lookup::Id(primary_id)).await? else {
                return Ok(None);
            };

            let parent = self.to_secondary(spec, &parent).await?;
            let key = parent.project(&spec.natural_key_indices());
            let found = self
                .secondary
                .find_row(spec, Lookup::NaturalKey(&key))
                .await?
                .and_then(|r| r.id);

            if let Some(id) = found {
                trace!(table, primary_id, secondary_id = id, "resolved reference");
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert((table, primary_id), id);
                }
            }
            Ok(found)
        }
        .boxed()
    }

    /// Rewrite a primary row into the form stored in the secondary.
    ///
    /// Foreign keys are translated (unresolvable references pass through
    /// unchanged) and timestamps are truncated to the shared precision. The
    /// row id is dropped.
    pub async fn to_secondary(&self, spec: &TableMigrationSpec, row: &Row) -> Result<Row> {
        Ok(self.translate(spec, row).await?.row)
    }

    /// [`to_secondary`](Self::to_secondary), also reporting which references
    /// were rewritten.
    pub async fn translate(&self, spec: &TableMigrationSpec, row: &Row) -> Result<Translation> {
        let mut values: Vec<SqlValue> = row
            .values
            .iter()
            .cloned()
            .map(|v| v.normalized(self.precision))
            .collect();
        let mut rewritten = Vec::new();

        for (idx, _, parent) in spec.foreign_keys() {
            let Some(primary_id) = values.get(idx).and_then(SqlValue::as_i64) else {
                continue;
            };
            if let Some(secondary_id) = self.resolve(parent, primary_id).await? {
                values[idx] = SqlValue::Int(secondary_id);
                if secondary_id != primary_id {
                    rewritten.push(Rewritten {
                        column: idx,
                        parent,
                        primary_id,
                    });
                }
            }
        }

        Ok(Translation {
            row: Row::new(values),
            rewritten,
        })
    }

    /// Timestamp precision applied by [`to_secondary`](Self::to_secondary).
    pub fn precision(&self) -> TimestampPrecision {
        self.precision
    }

    fn cached(&self, table: &'static str, primary_id: i64) -> Option<i64> {
        self.cache
            .lock()
            .ok()
            .and_then(|c| c.get(&(table, primary_id)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{CATEGORIES_SPEC, USERS_SPEC};
    use crate::drivers::memory::MemoryStore;
    use crate::error::StoreRole;
    use chrono::NaiveDate;

    fn created() -> SqlValue {
        SqlValue::Timestamp(
            NaiveDate::from_ymd_opt(2024, 1, 5)
                .unwrap()
                .and_hms_micro_opt(8, 30, 0, 250_000)
                .unwrap(),
        )
    }

    fn user(name: &str) -> Row {
        Row::new(vec![
            name.into(),
            "secret".into(),
            SqlValue::Null,
            created(),
            "USD".into(),
        ])
    }

    #[tokio::test]
    async fn test_resolves_by_natural_key() {
        let primary = Arc::new(MemoryStore::new(StoreRole::Primary));
        let secondary = Arc::new(MemoryStore::new(StoreRole::Secondary));
        secondary.ensure_table(&USERS_SPEC).await.unwrap();

        primary.seed(&USERS_SPEC, 10, user("alice"));
        // Same user under a different surrogate id.
        let stored = Row::new(
            user("alice")
                .values
                .into_iter()
                .map(|v| v.normalized(TimestampPrecision::Seconds))
                .collect(),
        );
        secondary.seed(&USERS_SPEC, 3, stored);

        let resolver = IdResolver::new(primary, secondary, TimestampPrecision::Seconds);
        assert_eq!(resolver.resolve("users", 10).await.unwrap(), Some(3));
        assert_eq!(resolver.resolve("users", 11).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_translation_reports_rewritten_references() {
        let primary = Arc::new(MemoryStore::new(StoreRole::Primary));
        let secondary = Arc::new(MemoryStore::new(StoreRole::Secondary));
        secondary.ensure_table(&USERS_SPEC).await.unwrap();
        primary.seed(&USERS_SPEC, 10, user("carol"));
        let stored = user("carol")
            .values
            .into_iter()
            .map(|v| v.normalized(TimestampPrecision::Seconds))
            .collect();
        secondary.seed(&USERS_SPEC, 2, Row::new(stored));

        let resolver = IdResolver::new(primary, secondary, TimestampPrecision::Seconds);
        let category = Row::with_id(
            1,
            vec!["Food".into(), "EXPENSE".into(), created(), SqlValue::Int(10)],
        );
        let translation = resolver.translate(&CATEGORIES_SPEC, &category).await.unwrap();
        assert_eq!(translation.row.values[3], SqlValue::Int(2));
        assert_eq!(
            translation.rewritten,
            vec![Rewritten {
                column: 3,
                parent: "users",
                primary_id: 10
            }]
        );
        // Key order is user_id, name, type.
        assert_eq!(
            translation.forward_key(&CATEGORIES_SPEC),
            Some(vec![SqlValue::Int(10), "Food".into(), "EXPENSE".into()])
        );
    }

    #[tokio::test]
    async fn test_unresolved_reference_passes_through() {
        let primary = Arc::new(MemoryStore::new(StoreRole::Primary));
        let secondary = Arc::new(MemoryStore::new(StoreRole::Secondary));
        primary.seed(&USERS_SPEC, 10, user("bob"));

        let resolver = IdResolver::new(primary, secondary, TimestampPrecision::Seconds);
        let category = Row::with_id(
            1,
            vec!["Food".into(), "EXPENSE".into(), created(), SqlValue::Int(10)],
        );
        let translated = resolver.to_secondary(&CATEGORIES_SPEC, &category).await.unwrap();
        assert_eq!(translated.id, None);
        assert_eq!(translated.values[3], SqlValue::Int(10));
        assert_eq!(
            translated.values[2],
            created().normalized(TimestampPrecision::Seconds)
        );
    }
}
