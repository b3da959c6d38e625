//! In-process store for tests and dry runs.
//!
//! Behaves like the SQL drivers where the migration logic can observe it:
//! auto-increment ids, foreign key enforcement that a session can switch off,
//! UNIQUE natural keys on tables created through `ensure_table`, and errors
//! classified the same way. Faults can be injected to exercise the
//! connectivity and unexpected-error paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::catalog;
use crate::core::traits::{Lookup, Store, WriteSession};
use crate::core::value::{Batch, Row, SqlValue};
use crate::core::TableMigrationSpec;
use crate::error::{MigrateError, Result, StoreRole};

#[derive(Debug, Default)]
struct MemTable {
    rows: BTreeMap<i64, Vec<SqlValue>>,
    next_id: i64,
    unique_natural_key: bool,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    /// Remaining successful inserts before the connection "drops".
    inserts_before_disconnect: Option<u64>,
    broken_tables: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<&'static str, MemTable>,
    faults: Faults,
    inserts: u64,
}

/// A [`Store`] backed by in-process maps.
#[derive(Clone)]
pub struct MemoryStore {
    role: StoreRole,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new(role: StoreRole) -> Self {
        Self {
            role,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Insert a row with an explicit id, bypassing constraints and faults.
    ///
    /// Creates the table (without a unique natural key) when missing.
    pub fn seed(&self, spec: &'static TableMigrationSpec, id: i64, row: Row) {
        let mut inner = self.lock();
        let table = inner.tables.entry(spec.name).or_default();
        table.rows.insert(id, row.values);
        table.next_id = table.next_id.max(id);
    }

    /// Snapshot of a table's rows ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .map(|(id, values)| Row::with_id(*id, values.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite one column of a stored row. Returns false when the row or
    /// column does not exist.
    pub fn update_value(&self, spec: &TableMigrationSpec, id: i64, column: &str, value: SqlValue) -> bool {
        let Some(idx) = spec.column_index(column) else {
            return false;
        };
        let mut inner = self.lock();
        match inner.tables.get_mut(spec.name).and_then(|t| t.rows.get_mut(&id)) {
            Some(values) => {
                values[idx] = value;
                true
            }
            None => false,
        }
    }

    /// Number of successful inserts through sessions.
    pub fn insert_count(&self) -> u64 {
        self.lock().inserts
    }

    /// Make every operation fail with a connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().faults.unreachable = unreachable;
    }

    /// Let `n` more inserts succeed, then behave as unreachable.
    pub fn disconnect_after_inserts(&self, n: u64) {
        self.lock().faults.inserts_before_disconnect = Some(n);
    }

    /// Make every operation on `table` fail with an unexpected store error.
    pub fn break_table(&self, table: &str) {
        self.lock().faults.broken_tables.insert(table.to_string());
    }

    /// Undo [`break_table`](Self::break_table).
    pub fn repair_table(&self, table: &str) {
        self.lock().faults.broken_tables.remove(table);
    }

    fn check_faults(&self, inner: &Inner, table: Option<&str>) -> Result<()> {
        check_faults(self.role, inner, table)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panicking test thread must not wedge the other tasks sharing the store.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_faults(role: StoreRole, inner: &Inner, table: Option<&str>) -> Result<()> {
    if inner.faults.unreachable {
        return Err(MigrateError::connectivity(role, "connection refused"));
    }
    if let Some(table) = table {
        if inner.faults.broken_tables.contains(table) {
            return Err(MigrateError::unexpected(
                table,
                format!("table '{}' is marked as crashed and should be repaired", table),
            ));
        }
    }
    Ok(())
}

fn missing_table(table: &str) -> MigrateError {
    MigrateError::unexpected(table, format!("table '{}' doesn't exist", table))
}

fn find(table: &MemTable, spec: &TableMigrationSpec, lookup: Lookup<'_>) -> Option<Row> {
    match lookup {
        Lookup::Id(id) => table.rows.get(&id).map(|v| Row::with_id(id, v.clone())),
        Lookup::NaturalKey(key) => {
            let indices = spec.natural_key_indices();
            table
                .rows
                .iter()
                .find(|(_, values)| {
                    indices
                        .iter()
                        .zip(key)
                        .all(|(&i, k)| values.get(i) == Some(k))
                })
                .map(|(id, values)| Row::with_id(*id, values.clone()))
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn db_type(&self) -> &str {
        "memory"
    }

    fn role(&self) -> StoreRole {
        self.role
    }

    async fn test_connection(&self) -> Result<()> {
        self.check_faults(&self.lock(), None)
    }

    fn read_table(
        &self,
        spec: &'static TableMigrationSpec,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(4);
        let inner = self.inner.clone();
        let role = self.role;

        tokio::spawn(async move {
            let snapshot = {
                let inner = lock(&inner);
                check_faults(role, &inner, Some(spec.name)).and_then(|_| {
                    inner
                        .tables
                        .get(spec.name)
                        .map(|t| {
                            t.rows
                                .iter()
                                .map(|(id, v)| Row::with_id(*id, v.clone()))
                                .collect::<Vec<_>>()
                        })
                        .ok_or_else(|| missing_table(spec.name))
                })
            };

            match snapshot {
                Ok(rows) => {
                    for chunk in rows.chunks(batch_size.max(1)) {
                        if tx.send(Ok(chunk.to_vec())).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        rx
    }

    async fn find_row(&self, spec: &TableMigrationSpec, lookup: Lookup<'_>) -> Result<Option<Row>> {
        let inner = self.lock();
        self.check_faults(&inner, Some(spec.name))?;
        let table = inner
            .tables
            .get(spec.name)
            .ok_or_else(|| missing_table(spec.name))?;
        Ok(find(table, spec, lookup))
    }

    async fn session(&self) -> Result<Box<dyn WriteSession>> {
        self.check_faults(&self.lock(), None)?;
        Ok(Box::new(MemorySession {
            role: self.role,
            inner: self.inner.clone(),
            foreign_key_checks: true,
        }))
    }

    async fn ensure_table(&self, spec: &TableMigrationSpec) -> Result<()> {
        let mut inner = self.lock();
        self.check_faults(&inner, Some(spec.name))?;
        let table = catalog::lookup(spec.name)?.name;
        let entry = inner.tables.entry(table).or_default();
        entry.unique_natural_key = true;
        debug!(table, "ensured memory table");
        Ok(())
    }

    async fn row_count(&self, spec: &TableMigrationSpec) -> Result<u64> {
        let inner = self.lock();
        self.check_faults(&inner, Some(spec.name))?;
        inner
            .tables
            .get(spec.name)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| missing_table(spec.name))
    }

    async fn count_orphans(&self, spec: &TableMigrationSpec) -> Result<u64> {
        let inner = self.lock();
        self.check_faults(&inner, Some(spec.name))?;
        let table = inner
            .tables
            .get(spec.name)
            .ok_or_else(|| missing_table(spec.name))?;

        let orphans = table
            .rows
            .values()
            .filter(|values| {
                spec.foreign_keys().any(|(idx, _, parent)| match values.get(idx) {
                    Some(SqlValue::Int(id)) => !inner
                        .tables
                        .get(parent)
                        .is_some_and(|p| p.rows.contains_key(id)),
                    _ => false,
                })
            })
            .count();
        Ok(orphans as u64)
    }

    async fn close(&self) {}
}

/// Session over a [`MemoryStore`]; foreign key checks are per session.
struct MemorySession {
    role: StoreRole,
    inner: Arc<Mutex<Inner>>,
    foreign_key_checks: bool,
}

#[async_trait]
impl WriteSession for MemorySession {
    async fn insert_row(&mut self, spec: &TableMigrationSpec, row: &Row) -> Result<i64> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        check_faults(self.role, inner, Some(spec.name))?;

        if let Some(remaining) = inner.faults.inserts_before_disconnect.as_mut() {
            if *remaining == 0 {
                inner.faults.unreachable = true;
                return Err(MigrateError::connectivity(
                    self.role,
                    "lost connection to server during query",
                ));
            }
            *remaining -= 1;
        }

        if row.values.len() != spec.columns.len() {
            return Err(MigrateError::unexpected(
                spec.name,
                format!(
                    "column count doesn't match value count ({} != {})",
                    spec.columns.len(),
                    row.values.len()
                ),
            ));
        }

        for (column, value) in spec.columns.iter().zip(&row.values) {
            if !column.nullable && value.is_null() {
                return Err(MigrateError::integrity(
                    spec.name,
                    format!("column '{}' cannot be null", column.name),
                ));
            }
        }

        if self.foreign_key_checks {
            for (idx, column, parent) in spec.foreign_keys() {
                if let Some(SqlValue::Int(id)) = row.values.get(idx) {
                    let exists = inner
                        .tables
                        .get(parent)
                        .is_some_and(|p| p.rows.contains_key(id));
                    if !exists {
                        return Err(MigrateError::integrity(
                            spec.name,
                            format!(
                                "foreign key constraint fails: {} references {}({})",
                                column.name, parent, id
                            ),
                        ));
                    }
                }
            }
        }

        let table = inner
            .tables
            .get_mut(spec.name)
            .ok_or_else(|| missing_table(spec.name))?;

        if table.unique_natural_key {
            let key = row.project(&spec.natural_key_indices());
            // NULLs never collide in a UNIQUE index.
            if !key.iter().any(SqlValue::is_null)
                && find(table, spec, Lookup::NaturalKey(&key)).is_some()
            {
                return Err(MigrateError::integrity(
                    spec.name,
                    format!(
                        "duplicate entry for key '{}_natural_key'",
                        spec.name
                    ),
                ));
            }
        }

        table.next_id += 1;
        let id = table.next_id;
        table.rows.insert(id, row.values.clone());
        inner.inserts += 1;
        Ok(id)
    }

    async fn update_row(&mut self, spec: &TableMigrationSpec, id: i64, row: &Row) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        check_faults(self.role, inner, Some(spec.name))?;

        let table = inner
            .tables
            .get_mut(spec.name)
            .ok_or_else(|| missing_table(spec.name))?;
        if table.unique_natural_key {
            let indices = spec.natural_key_indices();
            let key = row.project(&indices);
            let taken = table.rows.iter().any(|(other, values)| {
                *other != id
                    && indices
                        .iter()
                        .zip(&key)
                        .all(|(&i, k)| values.get(i) == Some(k))
            });
            if taken {
                return Err(MigrateError::integrity(
                    spec.name,
                    format!("duplicate entry for key '{}_natural_key'", spec.name),
                ));
            }
        }
        // Like UPDATE, a missing id changes nothing.
        if let Some(values) = table.rows.get_mut(&id) {
            *values = row.values.clone();
        }
        Ok(())
    }

    async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()> {
        check_faults(self.role, &lock(&self.inner), None)?;
        self.foreign_key_checks = enabled;
        Ok(())
    }

    fn restore_foreign_key_checks_detached(&mut self) {
        self.foreign_key_checks = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{CATEGORIES_SPEC, USERS_SPEC};
    use chrono::NaiveDate;

    fn created() -> SqlValue {
        SqlValue::Timestamp(
            NaiveDate::from_ymd_opt(2024, 2, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        )
    }

    fn user(name: &str) -> Row {
        Row::new(vec![
            name.into(),
            "pw".into(),
            SqlValue::Null,
            created(),
            "USD".into(),
        ])
    }

    fn category(name: &str, user_id: i64) -> Row {
        Row::new(vec![
            name.into(),
            "EXPENSE".into(),
            created(),
            SqlValue::Int(user_id),
        ])
    }

    #[tokio::test]
    async fn test_unique_natural_key() {
        let store = MemoryStore::new(StoreRole::Secondary);
        store.ensure_table(&USERS_SPEC).await.unwrap();
        let mut session = store.session().await.unwrap();

        assert_eq!(session.insert_row(&USERS_SPEC, &user("a")).await.unwrap(), 1);
        let err = session.insert_row(&USERS_SPEC, &user("a")).await.unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(session.insert_row(&USERS_SPEC, &user("b")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_foreign_key_enforcement_is_per_session() {
        let store = MemoryStore::new(StoreRole::Secondary);
        store.ensure_table(&USERS_SPEC).await.unwrap();
        store.ensure_table(&CATEGORIES_SPEC).await.unwrap();

        let mut session = store.session().await.unwrap();
        let err = session
            .insert_row(&CATEGORIES_SPEC, &category("Food", 42))
            .await
            .unwrap_err();
        assert!(err.is_integrity());

        session.set_foreign_key_checks(false).await.unwrap();
        session
            .insert_row(&CATEGORIES_SPEC, &category("Food", 42))
            .await
            .unwrap();
        assert_eq!(store.count_orphans(&CATEGORIES_SPEC).await.unwrap(), 1);

        let mut other = store.session().await.unwrap();
        assert!(other
            .insert_row(&CATEGORIES_SPEC, &category("Rent", 42))
            .await
            .unwrap_err()
            .is_integrity());
    }

    #[tokio::test]
    async fn test_update_row_keeps_natural_key_unique() {
        let store = MemoryStore::new(StoreRole::Secondary);
        store.ensure_table(&USERS_SPEC).await.unwrap();
        let mut session = store.session().await.unwrap();
        let a = session.insert_row(&USERS_SPEC, &user("a")).await.unwrap();
        session.insert_row(&USERS_SPEC, &user("b")).await.unwrap();

        session.update_row(&USERS_SPEC, a, &user("c")).await.unwrap();
        assert_eq!(store.rows("users")[0].values[0], SqlValue::from("c"));
        // Rewriting a row with its own key is not a collision.
        session.update_row(&USERS_SPEC, a, &user("c")).await.unwrap();

        let err = session.update_row(&USERS_SPEC, a, &user("b")).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_not_null_violation() {
        let store = MemoryStore::new(StoreRole::Secondary);
        store.ensure_table(&USERS_SPEC).await.unwrap();
        let mut row = user("c");
        row.values[0] = SqlValue::Null;
        let err = store
            .session()
            .await
            .unwrap()
            .insert_row(&USERS_SPEC, &row)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_read_table_batches() {
        let store = MemoryStore::new(StoreRole::Primary);
        for i in 1..=5 {
            store.seed(&USERS_SPEC, i, user(&format!("u{}", i)));
        }
        let mut rx = store.read_table(&USERS_SPEC, 2);
        let mut sizes = Vec::new();
        while let Some(batch) = rx.recv().await {
            sizes.push(batch.unwrap().len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_faults() {
        let store = MemoryStore::new(StoreRole::Secondary);
        store.ensure_table(&USERS_SPEC).await.unwrap();

        store.disconnect_after_inserts(1);
        let mut session = store.session().await.unwrap();
        session.insert_row(&USERS_SPEC, &user("a")).await.unwrap();
        assert!(session
            .insert_row(&USERS_SPEC, &user("b"))
            .await
            .unwrap_err()
            .is_connectivity());
        assert!(store.test_connection().await.unwrap_err().is_connectivity());

        let store = MemoryStore::new(StoreRole::Primary);
        store.seed(&USERS_SPEC, 1, user("a"));
        store.break_table("users");
        let err = store.row_count(&USERS_SPEC).await.unwrap_err();
        assert!(matches!(err, MigrateError::UnexpectedStore { .. }));
        store.repair_table("users");
        assert_eq!(store.row_count(&USERS_SPEC).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_row() {
        let store = MemoryStore::new(StoreRole::Primary);
        store.seed(&USERS_SPEC, 7, user("zed"));
        let by_id = store.find_row(&USERS_SPEC, Lookup::Id(7)).await.unwrap();
        assert_eq!(by_id.unwrap().values[0], SqlValue::from("zed"));

        let key = vec![SqlValue::from("zed")];
        let by_key = store
            .find_row(&USERS_SPEC, Lookup::NaturalKey(&key))
            .await
            .unwrap();
        assert_eq!(by_key.unwrap().id, Some(7));
    }
}
