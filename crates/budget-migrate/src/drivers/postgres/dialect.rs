//! PostgreSQL SQL dialect.
//!
//! Every selected column and every parameter carries an explicit cast so
//! the wire types tokio-postgres sees are fixed regardless of how the
//! application schema declared the column (`int4` vs `int8`, `varchar` vs
//! `text`, `timestamptz` vs `timestamp`).

use crate::core::{ColumnType, TableMigrationSpec};
use crate::drivers::common::{natural_key_index_name, Dialect};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    /// Cast target for a column type.
    pub fn cast(ty: ColumnType) -> &'static str {
        match ty {
            ColumnType::Text | ColumnType::Enum => "text",
            ColumnType::Integer | ColumnType::ForeignKey(_) => "int8",
            ColumnType::Float => "float8",
            ColumnType::Boolean => "bool",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        }
    }

    /// Switch trigger-based foreign key enforcement for the session.
    pub fn set_foreign_key_checks(enabled: bool) -> &'static str {
        if enabled {
            "SET session_replication_role = DEFAULT"
        } else {
            "SET session_replication_role = replica"
        }
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize, ty: ColumnType) -> String {
        format!("${}::{}", index, Self::cast(ty))
    }

    fn select_expr(&self, column: &str, ty: ColumnType) -> String {
        format!("{}::{}", self.quote_ident(column), Self::cast(ty))
    }

    fn null_safe_eq(&self, lhs: &str, rhs: &str) -> String {
        format!("{} IS NOT DISTINCT FROM {}", lhs, rhs)
    }

    fn ddl_type(&self, ty: ColumnType) -> &'static str {
        match ty {
            ColumnType::Text | ColumnType::Enum => "VARCHAR(255)",
            ColumnType::Integer | ColumnType::ForeignKey(_) => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    fn create_table_statements(&self, spec: &TableMigrationSpec) -> Vec<String> {
        let mut defs = vec![format!("{} BIGSERIAL PRIMARY KEY", self.quote_ident("id"))];
        defs.extend(self.column_definitions(spec));
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                self.quote_ident(spec.name),
                defs.join(", ")
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                self.quote_ident(&natural_key_index_name(spec)),
                self.quote_ident(spec.name),
                self.natural_key_columns(spec)
            ),
        ]
    }

    fn returning_id(&self) -> Option<String> {
        Some(format!("RETURNING {}::int8", self.quote_ident("id")))
    }

    fn count_expr(&self) -> &'static str {
        "COUNT(*)::int8"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{BUDGET_TYPES_SPEC, CATEGORIES_SPEC, USERS_SPEC};

    #[test]
    fn test_quote_ident() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.quote_ident("type"), "\"type\"");
        assert_eq!(dialect.quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_select_all_casts_columns() {
        let sql = PostgresDialect::new().select_all(&CATEGORIES_SPEC);
        assert_eq!(
            sql,
            "SELECT \"id\"::int8, \"name\"::text, \"type\"::text, \"created_at\"::timestamp, \
             \"user_id\"::int8 FROM \"categories\" ORDER BY \"id\""
        );
    }

    #[test]
    fn test_select_by_natural_key() {
        let sql = PostgresDialect::new().select_by_natural_key(&CATEGORIES_SPEC);
        assert!(sql.contains(
            "WHERE \"user_id\" IS NOT DISTINCT FROM $1::int8 AND \"name\" IS NOT DISTINCT FROM $2::text \
             AND \"type\" IS NOT DISTINCT FROM $3::text"
        ));
        assert!(sql.ends_with("LIMIT 1"));
    }

    #[test]
    fn test_insert_returning_id() {
        let sql = PostgresDialect::new().insert(&BUDGET_TYPES_SPEC);
        assert_eq!(
            sql,
            "INSERT INTO \"budget_types\" (\"created_at\") VALUES ($1::timestamp) RETURNING \"id\"::int8"
        );
    }

    #[test]
    fn test_update_by_id() {
        let sql = PostgresDialect::new().update_by_id(&CATEGORIES_SPEC);
        assert_eq!(
            sql,
            "UPDATE \"categories\" SET \"name\" = $1::text, \"type\" = $2::text, \
             \"created_at\" = $3::timestamp, \"user_id\" = $4::int8 WHERE \"id\" = $5::int8"
        );
    }

    #[test]
    fn test_create_table_statements() {
        let stmts = PostgresDialect::new().create_table_statements(&CATEGORIES_SPEC);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS \"categories\" (\"id\" BIGSERIAL PRIMARY KEY"));
        assert!(stmts[0].contains("\"user_id\" BIGINT NOT NULL"));
        assert!(stmts[0].contains("FOREIGN KEY (\"user_id\") REFERENCES \"users\" (\"id\")"));
        assert_eq!(
            stmts[1],
            "CREATE UNIQUE INDEX IF NOT EXISTS \"uq_categories_natural_key\" ON \"categories\" \
             (\"user_id\", \"name\", \"type\")"
        );
    }

    #[test]
    fn test_count_orphans() {
        let dialect = PostgresDialect::new();
        assert!(dialect.count_orphans(&USERS_SPEC).is_none());
        let sql = dialect.count_orphans(&CATEGORIES_SPEC).unwrap();
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM \"users\" p WHERE p.\"id\" = c.\"user_id\")"));
    }

    #[test]
    fn test_foreign_key_switch() {
        assert_eq!(
            PostgresDialect::set_foreign_key_checks(false),
            "SET session_replication_role = replica"
        );
        assert_eq!(
            PostgresDialect::set_foreign_key_checks(true),
            "SET session_replication_role = DEFAULT"
        );
    }
}
