//! # budget-migrate
//!
//! Live migration of the budget application's data from a primary store
//! (PostgreSQL) to a secondary store (MySQL) without downtime.
//!
//! - **Shadow writes**: [`DualWriteCoordinator`] mirrors each application
//!   write into the secondary and falls back to the primary on divergence
//! - **Consistency checks**: [`ConsistencyChecker`] compares a table across
//!   both stores by natural key
//! - **Forklift**: [`ForkliftMigrator`] copies historical rows table by table,
//!   idempotently, in dependency order
//! - **Resume**: [`MigrationOrchestrator`] records runs in a signed JSON
//!   state file
//!
//! ## Example
//!
//! ```rust,no_run
//! use budget_migrate::{Config, MigrationOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> budget_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = MigrationOrchestrator::new(config)?;
//!     let run = orchestrator.run().await?;
//!     println!("copied {} rows, skipped {}", run.rows_copied, run.rows_skipped);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod shadow;
pub mod state;
pub mod transfer;
pub mod verify;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, ShadowConfig, StoreConfig};
pub use drivers::MemoryStore;
pub use error::{MigrateError, Result, StoreRole};
pub use model::{Budget, BudgetType, Category, CategoryType, Record, Recurring, RecurringType, Transaction, User};
pub use orchestrator::{HealthCheckResult, MigrationOrchestrator, MigrationPlan};
pub use shadow::{DualWriteCoordinator, PrimaryWrite, SecondaryWrite, WriteOutcome};
pub use state::{MigrationRun, RunStatus, TableReport};
pub use transfer::{ForkliftMigrator, TableCopyResult};
pub use verify::{ConsistencyChecker, ConsistencyReport};
