//! Core abstractions for the migration.
//!
//! - [`schema`] and [`catalog`]: the migrated tables, their columns, natural
//!   keys and dependency order
//! - [`value`]: row values and the comparison rules checks apply to them
//! - [`traits`]: the [`Store`] and [`WriteSession`] seams drivers implement
//! - [`session`]: scoped foreign key suspension
//! - [`resolver`]: primary-to-secondary id translation

pub mod catalog;
pub mod resolver;
pub mod schema;
pub mod session;
pub mod traits;
pub mod value;

pub use resolver::{IdResolver, Rewritten, Translation};
pub use schema::{ColumnSpec, ColumnType, TableMigrationSpec};
pub use session::ForeignKeyScope;
pub use traits::{Lookup, Store, WriteSession};
pub use value::{Batch, Row, SqlValue, ValueComparator};
