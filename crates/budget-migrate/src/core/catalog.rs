//! The six migrated tables and their fixed dependency order.

use std::collections::HashSet;

use super::schema::{ColumnSpec, ColumnType, TableMigrationSpec};
use crate::error::{MigrateError, Result};

pub const USERS: &str = "users";
pub const BUDGET_TYPES: &str = "budget_types";
pub const CATEGORIES: &str = "categories";
pub const BUDGETS: &str = "budgets";
pub const RECURRINGS: &str = "recurrings";
pub const TRANSACTIONS: &str = "transactions";

/// Copy order. Every table appears after all of its `depends_on` entries.
pub const MIGRATION_ORDER: [&str; 6] = [
    USERS,
    BUDGET_TYPES,
    CATEGORIES,
    BUDGETS,
    RECURRINGS,
    TRANSACTIONS,
];

use ColumnType::*;

pub static USERS_SPEC: TableMigrationSpec = TableMigrationSpec {
    name: USERS,
    columns: &[
        ColumnSpec::required("username", Text),
        ColumnSpec::required("password", Text),
        ColumnSpec::optional("name", Text),
        ColumnSpec::required("created_at", Timestamp),
        ColumnSpec::optional("currency", Text),
    ],
    depends_on: &[],
    natural_key: &["username"],
};

pub static BUDGET_TYPES_SPEC: TableMigrationSpec = TableMigrationSpec {
    name: BUDGET_TYPES,
    columns: &[ColumnSpec::required("created_at", Timestamp)],
    depends_on: &[],
    natural_key: &["created_at"],
};

pub static CATEGORIES_SPEC: TableMigrationSpec = TableMigrationSpec {
    name: CATEGORIES,
    columns: &[
        ColumnSpec::required("name", Text),
        ColumnSpec::required("type", Enum),
        ColumnSpec::required("created_at", Timestamp),
        ColumnSpec::required("user_id", ForeignKey(USERS)),
    ],
    depends_on: &[USERS],
    natural_key: &["user_id", "name", "type"],
};

pub static BUDGETS_SPEC: TableMigrationSpec = TableMigrationSpec {
    name: BUDGETS,
    columns: &[
        ColumnSpec::required("name", Text),
        ColumnSpec::required("projected", Float),
        ColumnSpec::required("actual", Float),
        ColumnSpec::required("period_on", Date),
        ColumnSpec::required("created_at", Timestamp),
        ColumnSpec::required("user_id", ForeignKey(USERS)),
        ColumnSpec::required("category_id", ForeignKey(CATEGORIES)),
        ColumnSpec::optional("type_id", ForeignKey(BUDGET_TYPES)),
    ],
    depends_on: &[USERS, CATEGORIES, BUDGET_TYPES],
    natural_key: &["user_id", "category_id", "period_on", "name"],
};

pub static RECURRINGS_SPEC: TableMigrationSpec = TableMigrationSpec {
    name: RECURRINGS,
    columns: &[
        ColumnSpec::required("amount", Float),
        ColumnSpec::required("type", Enum),
        ColumnSpec::optional("last_run_at", Timestamp),
        ColumnSpec::required("created_at", Timestamp),
        ColumnSpec::required("budget_type_id", ForeignKey(BUDGET_TYPES)),
    ],
    depends_on: &[BUDGET_TYPES],
    natural_key: &["budget_type_id", "created_at"],
};

pub static TRANSACTIONS_SPEC: TableMigrationSpec = TableMigrationSpec {
    name: TRANSACTIONS,
    columns: &[
        ColumnSpec::required("name", Text),
        ColumnSpec::required("amount", Float),
        ColumnSpec::optional("remark", Text),
        ColumnSpec::required("auto", Boolean),
        ColumnSpec::required("transaction_on", Timestamp),
        ColumnSpec::required("created_at", Timestamp),
        ColumnSpec::required("budget_id", ForeignKey(BUDGETS)),
        ColumnSpec::optional("recurring_id", ForeignKey(RECURRINGS)),
    ],
    depends_on: &[BUDGETS, RECURRINGS],
    natural_key: &["budget_id", "name", "transaction_on", "created_at"],
};

/// All specs in migration order.
pub fn all() -> [&'static TableMigrationSpec; 6] {
    [
        &USERS_SPEC,
        &BUDGET_TYPES_SPEC,
        &CATEGORIES_SPEC,
        &BUDGETS_SPEC,
        &RECURRINGS_SPEC,
        &TRANSACTIONS_SPEC,
    ]
}

/// Find a spec by table name.
pub fn lookup(table: &str) -> Result<&'static TableMigrationSpec> {
    all()
        .into_iter()
        .find(|s| s.name == table)
        .ok_or_else(|| MigrateError::UnknownTable(table.to_string()))
}

/// Check the catalog invariants.
///
/// - every `depends_on` entry names a known table,
/// - every foreign key column references a table listed in `depends_on`,
/// - every natural key column is a mapped column,
/// - [`MIGRATION_ORDER`] places each table after its dependencies (which also
///   rules out cycles, since a cycle has no valid order).
pub fn validate() -> Result<()> {
    let known: HashSet<&str> = MIGRATION_ORDER.iter().copied().collect();
    let mut placed: HashSet<&str> = HashSet::new();

    for name in MIGRATION_ORDER {
        let spec = lookup(name)?;

        for dep in spec.depends_on {
            if !known.contains(dep) {
                return Err(MigrateError::Config(format!(
                    "{} depends on unknown table {}",
                    spec.name, dep
                )));
            }
            if !placed.contains(dep) {
                return Err(MigrateError::Config(format!(
                    "{} is ordered before its dependency {}",
                    spec.name, dep
                )));
            }
        }

        for (_, column, parent) in spec.foreign_keys() {
            if !spec.depends_on.contains(&parent) {
                return Err(MigrateError::Config(format!(
                    "{}.{} references {} which is not a declared dependency",
                    spec.name, column.name, parent
                )));
            }
        }

        for key in spec.natural_key {
            if spec.column_index(key).is_none() {
                return Err(MigrateError::Config(format!(
                    "{} natural key column {} is not mapped",
                    spec.name, key
                )));
            }
        }

        placed.insert(spec.name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_valid() {
        validate().unwrap();
    }

    #[test]
    fn test_order_matches_specs() {
        let names: Vec<_> = all().iter().map(|s| s.name).collect();
        assert_eq!(names, MIGRATION_ORDER.to_vec());
    }

    #[test]
    fn test_graph_is_acyclic() {
        // Kahn's algorithm over depends_on must consume every table.
        let specs = all();
        let mut remaining: Vec<_> = specs.to_vec();
        let mut done: HashSet<&str> = HashSet::new();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|s| {
                if s.depends_on.iter().all(|d| done.contains(d)) {
                    done.insert(s.name);
                    false
                } else {
                    true
                }
            });
            assert!(remaining.len() < before, "cycle among {:?}", remaining);
        }
    }

    #[test]
    fn test_exact_column_lists() {
        assert_eq!(
            USERS_SPEC.column_names(),
            vec!["username", "password", "name", "created_at", "currency"]
        );
        assert_eq!(BUDGET_TYPES_SPEC.column_names(), vec!["created_at"]);
        assert_eq!(
            CATEGORIES_SPEC.column_names(),
            vec!["name", "type", "created_at", "user_id"]
        );
        assert_eq!(
            BUDGETS_SPEC.column_names(),
            vec![
                "name",
                "projected",
                "actual",
                "period_on",
                "created_at",
                "user_id",
                "category_id",
                "type_id"
            ]
        );
        assert_eq!(
            RECURRINGS_SPEC.column_names(),
            vec!["amount", "type", "last_run_at", "created_at", "budget_type_id"]
        );
        assert_eq!(
            TRANSACTIONS_SPEC.column_names(),
            vec![
                "name",
                "amount",
                "remark",
                "auto",
                "transaction_on",
                "created_at",
                "budget_id",
                "recurring_id"
            ]
        );
    }

    #[test]
    fn test_lookup_unknown_table() {
        assert!(matches!(
            lookup("accounts"),
            Err(MigrateError::UnknownTable(_))
        ));
        assert_eq!(lookup("budgets").unwrap().name, "budgets");
    }
}
