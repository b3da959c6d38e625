//! SQL syntax strategy shared by the PostgreSQL and MySQL stores.
//!
//! Engines differ in quoting, placeholders, null-safe equality and DDL
//! types; the statement shapes built from a [`TableMigrationSpec`] are the
//! same and live in the default methods.

use crate::core::{ColumnType, TableMigrationSpec};

/// SQL syntax for one engine.
pub trait Dialect: Send + Sync {
    /// Engine name.
    fn name(&self) -> &str;

    /// Quote an identifier.
    fn quote_ident(&self, name: &str) -> String;

    /// Placeholder for the 1-based parameter `index` bound to a `ty` column.
    fn placeholder(&self, index: usize, ty: ColumnType) -> String;

    /// Expression selecting `column` so it decodes as `ty`.
    fn select_expr(&self, column: &str, ty: ColumnType) -> String {
        let _ = ty;
        self.quote_ident(column)
    }

    /// Comparison that treats NULL as equal to NULL.
    fn null_safe_eq(&self, lhs: &str, rhs: &str) -> String;

    /// DDL type for a mapped column.
    fn ddl_type(&self, ty: ColumnType) -> &'static str;

    /// Statements creating the table and its natural key index, idempotently.
    fn create_table_statements(&self, spec: &TableMigrationSpec) -> Vec<String>;

    /// Suffix appended to INSERT to return the new id, if the engine supports it.
    fn returning_id(&self) -> Option<String> {
        None
    }

    /// `id` plus every mapped column.
    fn select_list(&self, spec: &TableMigrationSpec) -> String {
        std::iter::once(self.select_expr("id", ColumnType::Integer))
            .chain(spec.columns.iter().map(|c| self.select_expr(c.name, c.ty)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Every row, ordered by id.
    fn select_all(&self, spec: &TableMigrationSpec) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY {}",
            self.select_list(spec),
            self.quote_ident(spec.name),
            self.quote_ident("id")
        )
    }

    /// One row by id; one parameter.
    fn select_by_id(&self, spec: &TableMigrationSpec) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.select_list(spec),
            self.quote_ident(spec.name),
            self.quote_ident("id"),
            self.placeholder(1, ColumnType::Integer)
        )
    }

    /// One row by natural key; one parameter per key column, in key order.
    fn select_by_natural_key(&self, spec: &TableMigrationSpec) -> String {
        let conditions = spec
            .natural_key
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let ty = spec
                    .column_index(key)
                    .map(|idx| spec.columns[idx].ty)
                    .unwrap_or(ColumnType::Text);
                self.null_safe_eq(&self.quote_ident(key), &self.placeholder(i + 1, ty))
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1",
            self.select_list(spec),
            self.quote_ident(spec.name),
            conditions,
            self.quote_ident("id")
        )
    }

    /// INSERT of the mapped columns; one parameter per column.
    fn insert(&self, spec: &TableMigrationSpec) -> String {
        let columns = spec
            .columns
            .iter()
            .map(|c| self.quote_ident(c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let values = spec
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| self.placeholder(i + 1, c.ty))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_ident(spec.name),
            columns,
            values
        );
        if let Some(returning) = self.returning_id() {
            sql.push(' ');
            sql.push_str(&returning);
        }
        sql
    }

    /// UPDATE of the mapped columns by id; one parameter per column, then the id.
    fn update_by_id(&self, spec: &TableMigrationSpec) -> String {
        let assignments = spec
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote_ident(c.name), self.placeholder(i + 1, c.ty)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.quote_ident(spec.name),
            assignments,
            self.quote_ident("id"),
            self.placeholder(spec.columns.len() + 1, ColumnType::Integer)
        )
    }

    /// Row count expression, decoding as a 64-bit integer.
    fn count_expr(&self) -> &'static str {
        "COUNT(*)"
    }

    fn count(&self, spec: &TableMigrationSpec) -> String {
        format!("SELECT {} FROM {}", self.count_expr(), self.quote_ident(spec.name))
    }

    /// Rows with at least one dangling reference, or `None` for tables
    /// without foreign keys.
    fn count_orphans(&self, spec: &TableMigrationSpec) -> Option<String> {
        let conditions: Vec<String> = spec
            .foreign_keys()
            .map(|(_, column, parent)| {
                let col = format!("c.{}", self.quote_ident(column.name));
                format!(
                    "({col} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.{id} = {col}))",
                    col = col,
                    parent = self.quote_ident(parent),
                    id = self.quote_ident("id"),
                )
            })
            .collect();
        if conditions.is_empty() {
            return None;
        }
        Some(format!(
            "SELECT {} FROM {} c WHERE {}",
            self.count_expr(),
            self.quote_ident(spec.name),
            conditions.join(" OR ")
        ))
    }

    /// Column definitions (without `id`), foreign key constraints included.
    fn column_definitions(&self, spec: &TableMigrationSpec) -> Vec<String> {
        let mut defs: Vec<String> = spec
            .columns
            .iter()
            .map(|c| {
                format!(
                    "{} {}{}",
                    self.quote_ident(c.name),
                    self.ddl_type(c.ty),
                    if c.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();
        for (_, column, parent) in spec.foreign_keys() {
            defs.push(format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                self.quote_ident(&format!("fk_{}_{}", spec.name, column.name)),
                self.quote_ident(column.name),
                self.quote_ident(parent),
                self.quote_ident("id")
            ));
        }
        defs
    }

    /// Quoted natural key column list.
    fn natural_key_columns(&self, spec: &TableMigrationSpec) -> String {
        spec.natural_key
            .iter()
            .map(|k| self.quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Name of the UNIQUE index that enforces a table's natural key.
pub fn natural_key_index_name(spec: &TableMigrationSpec) -> String {
    format!("uq_{}_natural_key", spec.name)
}
