//! Forklift: bulk copy of historical rows from the primary into the secondary.
//!
//! One table at a time, single task per table. Rows are streamed from the
//! primary through a bounded channel, translated into secondary terms and
//! inserted one by one through a single write session whose foreign key
//! checks are suspended for the whole table. Re-running a copy is safe: rows
//! already present hit the secondary's natural-key UNIQUE index and are
//! counted as skipped. A row copied before its parents keeps their primary
//! ids; a later pass finds it under that key and repoints it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::catalog;
use crate::core::{ForeignKeyScope, IdResolver, Lookup, Row, Store, TableMigrationSpec, Translation};
use crate::error::{MigrateError, Result};

/// Outcome of copying one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCopyResult {
    pub table: String,

    /// Rows inserted into the secondary.
    pub rows_copied: u64,

    /// Rows rejected by an integrity constraint, duplicates included.
    pub rows_skipped: u64,

    /// Rows that failed with an unexpected store error.
    pub rows_failed: u64,

    /// Connectivity failure that stopped the table, if any. Rows copied
    /// before it are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,

    /// The table could not be read or written to the end for a reason other
    /// than connectivity. Rows copied before it are kept.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,

    /// Unexpected store errors, in the order they occurred.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Wall time spent on the table.
    #[serde(default, with = "duration_millis")]
    pub duration: Duration,
}

impl TableCopyResult {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// A table the migrator refused to start.
    pub(crate) fn refused(table: &str, err: &MigrateError) -> Self {
        warn!(table, "table copy refused: {}", err);
        Self {
            table: table.to_string(),
            aborted: Some(err.to_string()),
            ..Self::default()
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Every primary row was read and handed to the secondary.
    pub fn is_complete(&self) -> bool {
        !self.is_aborted() && !self.incomplete
    }

    fn abort(&mut self, err: &MigrateError) {
        error!(table = %self.table, "table copy aborted: {}", err);
        if self.aborted.is_none() {
            self.aborted = Some(err.to_string());
        }
    }

    fn record_error(&mut self, err: &MigrateError) {
        error!(table = %self.table, "unexpected store error: {}", err);
        self.errors.push(err.to_string());
    }

    /// Table-level failure outside a row: abort on connectivity, otherwise
    /// collect the error.
    fn record_failure(&mut self, err: &MigrateError) {
        if err.is_connectivity() {
            self.abort(err);
        } else {
            self.record_error(err);
        }
    }

    /// Like [`record_failure`](Self::record_failure), for failures that leave
    /// rows uncopied.
    fn stop(&mut self, err: &MigrateError) {
        self.record_failure(err);
        if !err.is_connectivity() {
            self.incomplete = true;
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Whether the table copy goes on after a row.
#[derive(Debug, PartialEq, Eq)]
enum RowFlow {
    Continue,
    Abort,
}

/// Count a row-level error and decide whether to go on.
fn triage(result: &mut TableCopyResult, err: MigrateError) -> RowFlow {
    if err.is_integrity() {
        warn!(table = %result.table, "row skipped: {}", err);
        result.rows_skipped += 1;
        RowFlow::Continue
    } else if err.is_connectivity() {
        result.abort(&err);
        RowFlow::Abort
    } else {
        result.record_error(&err);
        result.rows_failed += 1;
        RowFlow::Continue
    }
}

/// Copies tables from the primary into the secondary.
pub struct ForkliftMigrator {
    primary: Arc<dyn Store>,
    secondary: Arc<dyn Store>,
    resolver: Arc<IdResolver>,
    fetch_size: usize,
    suspend_foreign_keys: bool,
    copied: Mutex<HashSet<&'static str>>,
}

impl ForkliftMigrator {
    pub fn new(
        primary: Arc<dyn Store>,
        secondary: Arc<dyn Store>,
        resolver: Arc<IdResolver>,
        fetch_size: usize,
        suspend_foreign_keys: bool,
    ) -> Self {
        Self {
            primary,
            secondary,
            resolver,
            fetch_size: fetch_size.max(1),
            suspend_foreign_keys,
            copied: Mutex::new(HashSet::new()),
        }
    }

    /// Treat `table` as already copied, e.g. by an earlier run being resumed.
    pub fn mark_copied(&self, table: &'static str) {
        if let Ok(mut copied) = self.copied.lock() {
            copied.insert(table);
        }
    }

    /// Copy every primary row of `spec` into the secondary.
    ///
    /// Returns an error only for misuse: a dependent table requested before
    /// its parents while foreign key suspension is off. Store failures are
    /// reported in the result.
    pub async fn copy_table(&self, spec: &'static TableMigrationSpec) -> Result<TableCopyResult> {
        self.check_dependencies(spec)?;

        let start = Instant::now();
        let mut result = TableCopyResult::new(spec.name);
        info!(table = spec.name, "copying table");

        match self.secondary.session().await {
            Ok(session) => {
                let mut scope = ForeignKeyScope::new(session);
                self.copy_rows(spec, &mut scope, &mut result).await;
                if let Err(e) = scope.restore().await {
                    result.record_failure(&e);
                }
            }
            Err(e) => result.stop(&e),
        }

        result.duration = start.elapsed();
        if result.is_complete() {
            self.mark_copied(spec.name);
        }

        info!(
            table = spec.name,
            rows_copied = result.rows_copied,
            rows_skipped = result.rows_skipped,
            rows_failed = result.rows_failed,
            aborted = result.is_aborted(),
            incomplete = result.incomplete,
            duration_ms = result.duration.as_millis() as u64,
            "table copy finished"
        );
        Ok(result)
    }

    fn check_dependencies(&self, spec: &TableMigrationSpec) -> Result<()> {
        if self.suspend_foreign_keys || !spec.has_dependencies() {
            return Ok(());
        }
        let copied = self
            .copied
            .lock()
            .map_err(|_| MigrateError::State("forklift bookkeeping lock poisoned".into()))?;
        let missing: Vec<&str> = spec
            .depends_on
            .iter()
            .copied()
            .filter(|d| !copied.contains(d))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MigrateError::config(format_args!(
                "cannot copy {} before {} with suspend_foreign_keys disabled",
                spec.name,
                missing.join(", ")
            )))
        }
    }

    async fn copy_rows(
        &self,
        spec: &'static TableMigrationSpec,
        scope: &mut ForeignKeyScope,
        result: &mut TableCopyResult,
    ) {
        if self.suspend_foreign_keys {
            if let Err(e) = scope.suspend_for(spec).await {
                result.stop(&e);
                return;
            }
        }

        let mut rx = self.primary.read_table(spec, self.fetch_size);
        while let Some(batch) = rx.recv().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    // The cursor is gone either way.
                    result.stop(&e);
                    return;
                }
            };
            debug!(table = spec.name, rows = batch.len(), "batch received");

            for row in &batch {
                if self.copy_row(spec, scope, row, result).await == RowFlow::Abort {
                    return;
                }
            }
        }
    }

    async fn copy_row(
        &self,
        spec: &'static TableMigrationSpec,
        scope: &mut ForeignKeyScope,
        row: &Row,
        result: &mut TableCopyResult,
    ) -> RowFlow {
        let translation = match self.resolver.translate(spec, row).await {
            Ok(translation) => translation,
            Err(e) => return triage(result, e),
        };

        match self.forward_copy(spec, &translation).await {
            Ok(Some(id)) => return repoint(spec, scope, id, &translation, result).await,
            Ok(None) => {}
            Err(e) => return triage(result, e),
        }

        match scope.insert_row(spec, &translation.row).await {
            Ok(id) => {
                debug!(table = spec.name, primary_id = ?row.id, secondary_id = id, "row copied");
                result.rows_copied += 1;
                RowFlow::Continue
            }
            Err(e) => {
                if e.is_integrity() && spec.name == catalog::BUDGET_TYPES {
                    warn!(
                        primary_id = ?row.id,
                        precision = ?self.resolver.precision(),
                        "budget type shares its created_at with a copied one and is skipped"
                    );
                }
                triage(result, e)
            }
        }
    }

    /// Id of a secondary row an earlier pass copied before the parents of
    /// `translation` existed in the secondary.
    ///
    /// Such a row still references the parents by primary id. A match only
    /// counts while those references dangle: a live parent under that id
    /// means the row belongs to someone else.
    async fn forward_copy(
        &self,
        spec: &TableMigrationSpec,
        translation: &Translation,
    ) -> Result<Option<i64>> {
        let Some(key) = translation.forward_key(spec) else {
            return Ok(None);
        };
        let Some(found) = self
            .secondary
            .find_row(spec, Lookup::NaturalKey(&key))
            .await?
        else {
            return Ok(None);
        };

        let indices = spec.natural_key_indices();
        for r in translation.rewritten.iter().filter(|r| indices.contains(&r.column)) {
            let parent = catalog::lookup(r.parent)?;
            if self
                .secondary
                .find_row(parent, Lookup::Id(r.primary_id))
                .await?
                .is_some()
            {
                return Ok(None);
            }
        }
        Ok(found.id)
    }
}

/// Point a forward-copied row at its resolved parents. The row is already
/// there, so it counts as skipped.
async fn repoint(
    spec: &TableMigrationSpec,
    scope: &mut ForeignKeyScope,
    id: i64,
    translation: &Translation,
    result: &mut TableCopyResult,
) -> RowFlow {
    match scope.update_row(spec, id, &translation.row).await {
        Ok(()) => {
            info!(table = spec.name, secondary_id = id, "repointed row copied before its parents");
            result.rows_skipped += 1;
            RowFlow::Continue
        }
        Err(e) => triage(result, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimestampPrecision;
    use crate::core::catalog::{self, BUDGETS_SPEC, CATEGORIES_SPEC, USERS_SPEC};
    use crate::core::SqlValue;
    use crate::drivers::memory::MemoryStore;
    use crate::error::StoreRole;
    use chrono::NaiveDate;

    fn created() -> SqlValue {
        SqlValue::Timestamp(
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        )
    }

    fn user(name: &str) -> Row {
        Row::new(vec![
            name.into(),
            "hash".into(),
            SqlValue::Null,
            created(),
            "USD".into(),
        ])
    }

    struct Fixture {
        primary: MemoryStore,
        secondary: MemoryStore,
    }

    impl Fixture {
        async fn new() -> Self {
            let secondary = MemoryStore::new(StoreRole::Secondary);
            for spec in catalog::all() {
                secondary.ensure_table(spec).await.unwrap();
            }
            Self {
                primary: MemoryStore::new(StoreRole::Primary),
                secondary,
            }
        }

        fn migrator(&self, suspend_foreign_keys: bool) -> ForkliftMigrator {
            let p: Arc<dyn Store> = Arc::new(self.primary.clone());
            let s: Arc<dyn Store> = Arc::new(self.secondary.clone());
            let resolver = Arc::new(IdResolver::new(p.clone(), s.clone(), TimestampPrecision::Seconds));
            ForkliftMigrator::new(p, s, resolver, 2, suspend_foreign_keys)
        }
    }

    #[tokio::test]
    async fn test_copy_is_idempotent() {
        let f = Fixture::new().await;
        for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
            f.primary.seed(&USERS_SPEC, id, user(name));
        }

        let first = f.migrator(true).copy_table(&USERS_SPEC).await.unwrap();
        assert_eq!(first.rows_copied, 3);
        assert_eq!(first.rows_skipped, 0);

        let second = f.migrator(true).copy_table(&USERS_SPEC).await.unwrap();
        assert_eq!(second.rows_copied, 0);
        assert_eq!(second.rows_skipped, 3);
        assert_eq!(f.secondary.rows("users").len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_row_does_not_block_others() {
        let f = Fixture::new().await;
        f.primary.seed(&USERS_SPEC, 1, user("alice"));
        f.primary.seed(&USERS_SPEC, 2, user("bob"));
        f.primary.seed(&USERS_SPEC, 3, user("carol"));
        f.secondary.seed(&USERS_SPEC, 50, user("bob"));

        let result = f.migrator(true).copy_table(&USERS_SPEC).await.unwrap();
        assert_eq!(result.rows_copied, 2);
        assert_eq!(result.rows_skipped, 1);
        assert_eq!(result.rows_failed, 0);
    }

    #[tokio::test]
    async fn test_connectivity_loss_aborts_table_and_keeps_rows() {
        let f = Fixture::new().await;
        for (id, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            f.primary.seed(&USERS_SPEC, id, user(name));
        }
        f.secondary.disconnect_after_inserts(2);

        let result = f.migrator(true).copy_table(&USERS_SPEC).await.unwrap();
        assert_eq!(result.rows_copied, 2);
        assert!(result.is_aborted());
        assert_eq!(f.secondary.rows("users").len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_secondary_aborts() {
        let f = Fixture::new().await;
        f.primary.seed(&USERS_SPEC, 1, user("alice"));
        f.secondary.set_unreachable(true);

        let result = f.migrator(true).copy_table(&USERS_SPEC).await.unwrap();
        assert!(result.is_aborted());
        assert_eq!(result.rows_copied, 0);
    }

    #[tokio::test]
    async fn test_unexpected_error_is_collected() {
        let f = Fixture::new().await;
        f.primary.seed(&USERS_SPEC, 1, user("alice"));
        f.primary.break_table("users");

        let result = f.migrator(true).copy_table(&USERS_SPEC).await.unwrap();
        assert!(!result.is_aborted());
        assert!(result.incomplete);
        assert!(!result.is_complete());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.rows_copied, 0);
    }

    #[tokio::test]
    async fn test_failed_insert_keeps_table_complete() {
        let f = Fixture::new().await;
        f.primary.seed(&USERS_SPEC, 1, user("alice"));
        f.secondary.break_table("users");

        let result = f.migrator(true).copy_table(&USERS_SPEC).await.unwrap();
        assert_eq!(result.rows_failed, 1);
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn test_child_copied_before_parent_is_repointed() {
        let f = Fixture::new().await;
        f.primary.seed(&USERS_SPEC, 10, user("alice"));
        f.primary.seed(
            &CATEGORIES_SPEC,
            1,
            Row::new(vec!["Food".into(), "EXPENSE".into(), created(), SqlValue::Int(10)]),
        );

        // Categories first: users 10 is not in the secondary yet.
        let migrator = f.migrator(true);
        let first = migrator.copy_table(&CATEGORIES_SPEC).await.unwrap();
        assert_eq!(first.rows_copied, 1);
        assert_eq!(f.secondary.rows("categories")[0].values[3], SqlValue::Int(10));
        migrator.copy_table(&USERS_SPEC).await.unwrap();
        let alice = f.secondary.rows("users")[0].id.unwrap();
        assert_ne!(alice, 10);

        let second = f.migrator(true).copy_table(&CATEGORIES_SPEC).await.unwrap();
        assert_eq!(second.rows_copied, 0);
        assert_eq!(second.rows_skipped, 1);

        let categories = f.secondary.rows("categories");
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].values[3], SqlValue::Int(alice));
        assert_eq!(f.secondary.count_orphans(&CATEGORIES_SPEC).await.unwrap(), 0);

        let third = f.migrator(true).copy_table(&CATEGORIES_SPEC).await.unwrap();
        assert_eq!((third.rows_copied, third.rows_skipped), (0, 1));
    }

    #[tokio::test]
    async fn test_live_parent_under_primary_id_is_not_repointed() {
        let f = Fixture::new().await;
        f.primary.seed(&USERS_SPEC, 1, user("alice"));
        f.primary.seed(
            &CATEGORIES_SPEC,
            1,
            Row::new(vec!["Food".into(), "EXPENSE".into(), created(), SqlValue::Int(1)]),
        );
        // bob holds secondary id 1 and has his own Food category; alice
        // lands on id 2.
        f.secondary.seed(&USERS_SPEC, 1, user("bob"));
        f.secondary.seed(
            &CATEGORIES_SPEC,
            5,
            Row::new(vec!["Food".into(), "EXPENSE".into(), created(), SqlValue::Int(1)]),
        );

        let migrator = f.migrator(true);
        migrator.copy_table(&USERS_SPEC).await.unwrap();
        let result = migrator.copy_table(&CATEGORIES_SPEC).await.unwrap();
        assert_eq!(result.rows_copied, 1);

        let categories = f.secondary.rows("categories");
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[0].values[3], SqlValue::Int(1));
        assert_eq!(categories[1].values[3], SqlValue::Int(2));
    }

    #[tokio::test]
    async fn test_refuses_dependent_table_without_suspension() {
        let f = Fixture::new().await;
        let migrator = f.migrator(false);

        let err = migrator.copy_table(&BUDGETS_SPEC).await.unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));

        migrator.copy_table(&USERS_SPEC).await.unwrap();
        let err = migrator.copy_table(&CATEGORIES_SPEC).await;
        assert!(err.is_ok());
    }

    #[tokio::test]
    async fn test_result_serializes_duration_as_millis() {
        let mut result = TableCopyResult::new("users");
        result.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1500);
        assert!(json.get("aborted").is_none());
        assert!(json.get("incomplete").is_none());
    }
}
