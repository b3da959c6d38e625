//! Store abstraction shared by the coordinator, checker and forklift.
//!
//! - [`Store`]: a pooled handle to one database (primary or secondary)
//! - [`WriteSession`]: one checked-out connection used for a scoped batch of
//!   inserts, so session settings such as foreign key checks stick to it

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Result, StoreRole};

use super::schema::TableMigrationSpec;
use super::value::{Batch, Row, SqlValue};

/// How to find a single row.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    /// By the store-local surrogate id.
    Id(i64),
    /// By natural key values, in `natural_key` order. NULL matches NULL.
    NaturalKey(&'a [SqlValue]),
}

/// A database participating in the migration.
///
/// Handles are shared (`Arc<dyn Store>`) across all operations of a run. Every
/// method acquires its own pooled connection and releases it before returning,
/// except [`session`](Store::session) which hands the connection to the caller.
///
/// # Errors
///
/// Implementations classify driver errors at this boundary:
/// [`MigrateError::Connectivity`](crate::MigrateError::Connectivity) for
/// network/pool failures, [`MigrateError::Integrity`](crate::MigrateError::Integrity)
/// for constraint violations and
/// [`MigrateError::UnexpectedStore`](crate::MigrateError::UnexpectedStore)
/// for everything else.
#[async_trait]
pub trait Store: Send + Sync {
    /// Engine identifier ("postgres", "mysql", "memory").
    fn db_type(&self) -> &str;

    /// Role this store plays, used to tag connectivity errors.
    fn role(&self) -> StoreRole;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Stream every row of `spec`'s table.
    ///
    /// Rows are read through a server-side cursor by a spawned task and
    /// delivered in batches of at most `batch_size`. The channel is bounded,
    /// so a slow consumer applies backpressure to the cursor. A failure is
    /// delivered as the last message.
    fn read_table(
        &self,
        spec: &'static TableMigrationSpec,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Batch>>;

    /// Fetch one row, or `None` when nothing matches.
    async fn find_row(&self, spec: &TableMigrationSpec, lookup: Lookup<'_>)
        -> Result<Option<Row>>;

    /// Check out a connection for a batch of inserts.
    async fn session(&self) -> Result<Box<dyn WriteSession>>;

    /// Create the table if it is missing: surrogate `id`, the mapped columns
    /// and a UNIQUE index over the natural key.
    async fn ensure_table(&self, spec: &TableMigrationSpec) -> Result<()>;

    /// Number of rows in the table.
    async fn row_count(&self, spec: &TableMigrationSpec) -> Result<u64>;

    /// Rows whose non-null foreign key has no parent row.
    async fn count_orphans(&self, spec: &TableMigrationSpec) -> Result<u64>;

    /// Close the connection pool.
    async fn close(&self);
}

/// A checked-out connection.
#[async_trait]
pub trait WriteSession: Send {
    /// Insert one row (`row.id` is ignored) and return the new surrogate id.
    async fn insert_row(&mut self, spec: &TableMigrationSpec, row: &Row) -> Result<i64>;

    /// Overwrite every mapped column of the row with surrogate `id`.
    async fn update_row(&mut self, spec: &TableMigrationSpec, id: i64, row: &Row) -> Result<()>;

    /// Enable or disable foreign key enforcement for this connection.
    async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()>;

    /// Re-enable foreign key checks without awaiting.
    ///
    /// Called from `Drop` when a scope is left without an explicit restore.
    /// Implementations may spawn the work onto the runtime.
    fn restore_foreign_key_checks_detached(&mut self);
}
