//! MySQL SQL dialect.

use crate::core::{ColumnType, TableMigrationSpec};
use crate::drivers::common::{natural_key_index_name, Dialect};

/// MySQL 5.7+ / 8.0 dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    pub fn new() -> Self {
        Self
    }

    /// Switch foreign key enforcement for the connection.
    pub fn set_foreign_key_checks(enabled: bool) -> &'static str {
        if enabled {
            "SET FOREIGN_KEY_CHECKS=1"
        } else {
            "SET FOREIGN_KEY_CHECKS=0"
        }
    }

    /// Count of index entries named `?` on table `?` in the current schema.
    pub fn index_exists() -> &'static str {
        "SELECT COUNT(*) FROM information_schema.statistics \
         WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?"
    }

    /// Add the natural key UNIQUE index to a table created elsewhere.
    pub fn add_natural_key(&self, spec: &TableMigrationSpec) -> String {
        format!(
            "ALTER TABLE {} ADD UNIQUE KEY {} ({})",
            self.quote_ident(spec.name),
            self.quote_ident(&natural_key_index_name(spec)),
            self.natural_key_columns(spec)
        )
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize, _ty: ColumnType) -> String {
        "?".to_string()
    }

    fn null_safe_eq(&self, lhs: &str, rhs: &str) -> String {
        format!("{} <=> {}", lhs, rhs)
    }

    fn ddl_type(&self, ty: ColumnType) -> &'static str {
        match ty {
            ColumnType::Text | ColumnType::Enum => "VARCHAR(255)",
            ColumnType::Integer | ColumnType::ForeignKey(_) => "BIGINT",
            ColumnType::Float => "DOUBLE",
            ColumnType::Boolean => "TINYINT(1)",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "DATETIME",
        }
    }

    fn create_table_statements(&self, spec: &TableMigrationSpec) -> Vec<String> {
        // MySQL has no CREATE INDEX IF NOT EXISTS. The unique key is part of
        // the definition here; the store adds it to pre-existing tables.
        let mut defs = vec![format!(
            "{} BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
            self.quote_ident("id")
        )];
        defs.extend(self.column_definitions(spec));
        defs.push(format!(
            "UNIQUE KEY {} ({})",
            self.quote_ident(&natural_key_index_name(spec)),
            self.natural_key_columns(spec)
        ));
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            self.quote_ident(spec.name),
            defs.join(", ")
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{BUDGETS_SPEC, USERS_SPEC};

    #[test]
    fn test_quote_ident() {
        let dialect = MysqlDialect::new();
        assert_eq!(dialect.quote_ident("type"), "`type`");
        assert_eq!(dialect.quote_ident("odd`name"), "`odd``name`");
    }

    #[test]
    fn test_insert_uses_exact_columns() {
        let sql = MysqlDialect::new().insert(&USERS_SPEC);
        assert_eq!(
            sql,
            "INSERT INTO `users` (`username`, `password`, `name`, `created_at`, `currency`) \
             VALUES (?, ?, ?, ?, ?)"
        );
    }

    #[test]
    fn test_natural_key_lookup_is_null_safe() {
        let sql = MysqlDialect::new().select_by_natural_key(&BUDGETS_SPEC);
        assert!(sql.contains(
            "WHERE `user_id` <=> ? AND `category_id` <=> ? AND `period_on` <=> ? AND `name` <=> ?"
        ));
    }

    #[test]
    fn test_create_table_has_unique_natural_key() {
        let stmts = MysqlDialect::new().create_table_statements(&BUDGETS_SPEC);
        assert_eq!(stmts.len(), 1);
        let ddl = &stmts[0];
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS `budgets` (`id` BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"));
        assert!(ddl.contains("`projected` DOUBLE NOT NULL"));
        assert!(ddl.contains("`type_id` BIGINT,"));
        assert!(ddl.contains(
            "UNIQUE KEY `uq_budgets_natural_key` (`user_id`, `category_id`, `period_on`, `name`)"
        ));
        assert!(ddl.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"));
    }

    #[test]
    fn test_add_natural_key_to_existing_table() {
        let sql = MysqlDialect::new().add_natural_key(&USERS_SPEC);
        assert_eq!(
            sql,
            "ALTER TABLE `users` ADD UNIQUE KEY `uq_users_natural_key` (`username`)"
        );
        assert!(MysqlDialect::index_exists().contains("information_schema.statistics"));
    }

    #[test]
    fn test_update_by_id() {
        let sql = MysqlDialect::new().update_by_id(&USERS_SPEC);
        assert_eq!(
            sql,
            "UPDATE `users` SET `username` = ?, `password` = ?, `name` = ?, `created_at` = ?, \
             `currency` = ? WHERE `id` = ?"
        );
    }

    #[test]
    fn test_count_orphans() {
        let sql = MysqlDialect::new().count_orphans(&BUDGETS_SPEC).unwrap();
        assert!(sql.starts_with("SELECT COUNT(*) FROM `budgets` c WHERE"));
        assert!(sql.contains("SELECT 1 FROM `budget_types` p WHERE p.`id` = c.`type_id`"));
    }
}
