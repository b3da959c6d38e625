//! Store implementations.
//!
//! - [`postgres`]: tokio-postgres over a deadpool pool
//! - [`mysql`]: mysql_async, behind the `mysql` feature
//! - [`memory`]: in-process store with fault injection, used by tests
//! - [`common`]: TLS setup and the SQL [`Dialect`](common::Dialect) shared by
//!   the SQL stores
//!
//! [`connect`] picks the implementation from a [`StoreConfig`].

pub mod common;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod postgres;

use std::sync::Arc;

use crate::config::{StoreConfig, StoreType};
use crate::core::Store;
use crate::error::{Result, StoreRole};

pub use memory::MemoryStore;
#[cfg(feature = "mysql")]
pub use mysql::MysqlStore;
pub use postgres::PostgresStore;

/// Build the store described by `config`.
///
/// Pools are lazy; reachability is checked by
/// [`Store::test_connection`], not here.
pub fn connect(config: &StoreConfig, role: StoreRole) -> Result<Arc<dyn Store>> {
    match config.r#type {
        StoreType::Postgres => Ok(Arc::new(PostgresStore::connect(config, role)?)),
        #[cfg(feature = "mysql")]
        StoreType::Mysql => Ok(Arc::new(MysqlStore::connect(config, role)?)),
        #[cfg(not(feature = "mysql"))]
        StoreType::Mysql => Err(crate::error::MigrateError::config(format_args!(
            "{} store is MySQL but this build lacks the `mysql` feature",
            role
        ))),
    }
}
