//! MySQL driver, compiled with the `mysql` feature.
//!
//! - [`MysqlDialect`]: backtick quoting, `?` placeholders, `<=>` comparisons
//! - [`MysqlStore`]: pooled [`Store`](crate::core::Store) implementation
//!
//! Supports MySQL 5.7+ and 8.0.

mod dialect;
mod store;

pub use dialect::MysqlDialect;
pub use store::MysqlStore;

use mysql_async::DriverError;

use crate::error::{MigrateError, StoreRole};

/// Server error codes reported for constraint violations.
const INTEGRITY_CODES: &[u16] = &[
    1048, // column cannot be null
    1062, // duplicate entry
    1169, // unique constraint
    1216, // child row: foreign key fails
    1217, // parent row: foreign key fails
    1364, // field has no default
    1451, // cannot delete parent row
    1452, // cannot add child row
    1586, // duplicate entry for key
    3819, // check constraint violated
];

/// Server error codes that mean the server is unavailable to us.
const CONNECTIVITY_CODES: &[u16] = &[
    1040, // too many connections
    1053, // server shutdown in progress
    1152, // aborted connection
];

/// Classify a mysql_async error.
pub(crate) fn classify(err: mysql_async::Error, role: StoreRole, table: &str) -> MigrateError {
    match err {
        mysql_async::Error::Server(server) => classify_code(server.code, role, table, server.message),
        mysql_async::Error::Io(e) => MigrateError::connectivity(role, e),
        mysql_async::Error::Driver(e) => classify_driver(e, role, table),
        other => MigrateError::unexpected(table, other),
    }
}

/// Driver errors are mostly misuse (parameter counts, conversions). Only a
/// lost or shut down connection means the server is out of reach.
fn classify_driver(err: DriverError, role: StoreRole, table: &str) -> MigrateError {
    match err {
        DriverError::ConnectionClosed
        | DriverError::PoolDisconnected
        | DriverError::PacketOutOfOrder => MigrateError::connectivity(role, err),
        other => MigrateError::unexpected(table, other),
    }
}

fn classify_code(code: u16, role: StoreRole, table: &str, message: String) -> MigrateError {
    if INTEGRITY_CODES.contains(&code) {
        MigrateError::integrity(table, message)
    } else if CONNECTIVITY_CODES.contains(&code) {
        MigrateError::connectivity(role, message)
    } else {
        MigrateError::unexpected(table, format!("{} (code {})", message, code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_codes() {
        let classify = |code| classify_code(code, StoreRole::Secondary, "budgets", "boom".into());

        assert!(classify(1062).is_integrity());
        assert!(classify(1452).is_integrity());
        assert!(classify(1048).is_integrity());
        assert!(classify(1040).is_connectivity());
        match classify(1146) {
            MigrateError::UnexpectedStore { table, message } => {
                assert_eq!(table, "budgets");
                assert_eq!(message, "boom (code 1146)");
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_driver_errors() {
        let classify = |e| classify_driver(e, StoreRole::Secondary, "users");

        assert!(classify(DriverError::ConnectionClosed).is_connectivity());
        assert!(classify(DriverError::PoolDisconnected).is_connectivity());
        assert!(matches!(
            classify(DriverError::NestedTransaction),
            MigrateError::UnexpectedStore { .. }
        ));
        assert!(matches!(
            classify(DriverError::MixedParams),
            MigrateError::UnexpectedStore { .. }
        ));
    }
}
