//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL syntax with explicit casts
//! - [`PostgresStore`]: pooled [`Store`](crate::core::Store) implementation

mod dialect;
mod store;

pub use dialect::PostgresDialect;
pub use store::PostgresStore;

use tokio_postgres::error::SqlState;

use crate::error::{MigrateError, StoreRole};

/// Classify a tokio-postgres error.
///
/// SQLSTATE class 23 is an integrity violation; class 08, admin shutdown and
/// errors without a server response (I/O, closed connection) are
/// connectivity failures; everything else is unexpected.
pub(crate) fn classify(err: tokio_postgres::Error, role: StoreRole, table: &str) -> MigrateError {
    match err.code() {
        Some(code) => {
            let message = err
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| err.to_string());
            classify_sqlstate(code, role, table, message)
        }
        None if err.is_closed() || is_io(&err) => MigrateError::connectivity(role, &err),
        None => MigrateError::unexpected(table, &err),
    }
}

fn classify_sqlstate(code: &SqlState, role: StoreRole, table: &str, message: String) -> MigrateError {
    match &code.code()[..2] {
        "23" => MigrateError::integrity(table, message),
        // connection exception, insufficient resources, operator intervention
        "08" | "53" | "57" => MigrateError::connectivity(role, message),
        _ => MigrateError::unexpected(table, message),
    }
}

fn is_io(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner.is::<std::io::Error>() {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Pool checkout failures are always connectivity failures.
pub(crate) fn classify_pool(err: deadpool_postgres::PoolError, role: StoreRole) -> MigrateError {
    MigrateError::connectivity(role, format!("connection pool: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classes() {
        let role = StoreRole::Primary;
        let classify = |code: SqlState| classify_sqlstate(&code, role, "users", "boom".into());

        assert!(classify(SqlState::UNIQUE_VIOLATION).is_integrity());
        assert!(classify(SqlState::FOREIGN_KEY_VIOLATION).is_integrity());
        assert!(classify(SqlState::NOT_NULL_VIOLATION).is_integrity());
        assert!(classify(SqlState::CONNECTION_FAILURE).is_connectivity());
        assert!(classify(SqlState::ADMIN_SHUTDOWN).is_connectivity());
        assert!(matches!(
            classify(SqlState::UNDEFINED_TABLE),
            MigrateError::UnexpectedStore { .. }
        ));
    }
}
