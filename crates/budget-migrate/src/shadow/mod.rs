//! Online shadow writes.
//!
//! For every record the application persists, [`DualWriteCoordinator::write`]
//! inserts the same record into the secondary, checks the table, and writes
//! the record into the primary as well when the configured policy calls for
//! it. Nothing here ever fails the caller's operation: every failure is
//! logged and folded into the returned [`WriteOutcome`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{MismatchAggregation, PrimaryFallback, ShadowConfig};
use crate::core::{ForeignKeyScope, IdResolver, Store, TableMigrationSpec};
use crate::error::{MigrateError, Result, StoreRole};
use crate::model::Record;
use crate::verify::{ConsistencyChecker, ConsistencyReport};

/// What happened to the secondary copy of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SecondaryWrite {
    /// Inserted under a new secondary id.
    Inserted { id: i64 },
    /// Rejected by an integrity constraint; treated as already applied.
    AlreadyApplied { reason: String },
    /// A store could not be reached.
    Unavailable { reason: String },
    /// Unexpected store error.
    Failed { error: String },
    /// Shadow writes are switched off.
    Disabled,
}

/// What happened on the primary side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PrimaryWrite {
    /// The policy did not call for a primary write.
    Skipped,
    Inserted { id: i64 },
    /// Rejected by an integrity constraint; the record is already there.
    AlreadyPresent { reason: String },
    Failed { error: String },
}

impl fmt::Display for SecondaryWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecondaryWrite::Inserted { id } => write!(f, "inserted as {}", id),
            SecondaryWrite::AlreadyApplied { reason } => write!(f, "already applied ({})", reason),
            SecondaryWrite::Unavailable { reason } => write!(f, "unavailable ({})", reason),
            SecondaryWrite::Failed { error } => write!(f, "failed ({})", error),
            SecondaryWrite::Disabled => write!(f, "disabled"),
        }
    }
}

impl fmt::Display for PrimaryWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryWrite::Skipped => write!(f, "skipped"),
            PrimaryWrite::Inserted { id } => write!(f, "inserted as {}", id),
            PrimaryWrite::AlreadyPresent { reason } => write!(f, "already present ({})", reason),
            PrimaryWrite::Failed { error } => write!(f, "failed ({})", error),
        }
    }
}

/// Result of one [`DualWriteCoordinator::write`].
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub table: &'static str,
    pub secondary: SecondaryWrite,

    /// Check run after the secondary insert, if one ran and finished
    /// without an unexpected error.
    pub report: Option<ConsistencyReport>,

    /// Divergence signal compared against the fallback threshold.
    pub mismatch_signal: Option<u64>,

    pub primary: PrimaryWrite,

    /// Unexpected store errors met along the way.
    pub errors: Vec<String>,
}

impl WriteOutcome {
    fn new(table: &'static str, secondary: SecondaryWrite) -> Self {
        Self {
            table,
            secondary,
            report: None,
            mismatch_signal: None,
            primary: PrimaryWrite::Skipped,
            errors: Vec::new(),
        }
    }

    /// The secondary could not be reached.
    pub fn secondary_unavailable(&self) -> bool {
        matches!(self.secondary, SecondaryWrite::Unavailable { .. })
    }

    /// The record was also written to the primary.
    pub fn fell_back(&self) -> bool {
        matches!(self.primary, PrimaryWrite::Inserted { .. })
    }
}

/// Routes application writes to both stores.
///
/// Holds shared store handles only; every write acquires and releases its own
/// sessions.
pub struct DualWriteCoordinator {
    primary: Arc<dyn Store>,
    secondary: Arc<dyn Store>,
    resolver: Arc<IdResolver>,
    checker: Arc<ConsistencyChecker>,
    config: ShadowConfig,
    running_totals: Mutex<HashMap<&'static str, u64>>,
}

impl DualWriteCoordinator {
    pub fn new(
        primary: Arc<dyn Store>,
        secondary: Arc<dyn Store>,
        resolver: Arc<IdResolver>,
        checker: Arc<ConsistencyChecker>,
        config: ShadowConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            resolver,
            checker,
            config,
            running_totals: Mutex::new(HashMap::new()),
        }
    }

    /// Shadow-write `record`. Never fails.
    pub async fn write<R: Record>(&self, record: &R) -> WriteOutcome {
        let spec = record.spec();

        if !self.config.enabled {
            info!(table = spec.name, "shadow writes disabled, skipping");
            return WriteOutcome::new(spec.name, SecondaryWrite::Disabled);
        }

        let secondary = self.write_secondary(spec, record).await;
        info!(table = spec.name, outcome = %secondary, "secondary write");
        let mut outcome = WriteOutcome::new(spec.name, secondary);
        if let SecondaryWrite::Failed { error } = &outcome.secondary {
            outcome.errors.push(error.clone());
        }

        // Only a fresh insert is followed by a check.
        let inserted = matches!(outcome.secondary, SecondaryWrite::Inserted { .. });
        let diverged = inserted && self.check_table(spec, &mut outcome).await;

        let fall_back = match self.config.primary_fallback {
            PrimaryFallback::Always => true,
            PrimaryFallback::Never => false,
            PrimaryFallback::OnDivergence => diverged,
        };
        if fall_back {
            outcome.primary = self.write_primary(spec, record).await;
            info!(
                table = spec.name,
                outcome = %outcome.primary,
                signal = ?outcome.mismatch_signal,
                "primary fallback write"
            );
            if let PrimaryWrite::Failed { error } = &outcome.primary {
                outcome.errors.push(error.clone());
            }
        }

        outcome
    }

    /// Current running mismatch total for `table`.
    pub fn running_total(&self, table: &str) -> u64 {
        self.running_totals
            .lock()
            .ok()
            .and_then(|totals| totals.get(table).copied())
            .unwrap_or(0)
    }

    async fn write_secondary<R: Record>(&self, spec: &'static TableMigrationSpec, record: &R) -> SecondaryWrite {
        match self.insert_secondary(spec, record).await {
            Ok(id) => SecondaryWrite::Inserted { id },
            Err(e) if e.is_integrity() => {
                warn!(table = spec.name, "secondary insert rejected: {}", e);
                SecondaryWrite::AlreadyApplied {
                    reason: e.to_string(),
                }
            }
            Err(e) if e.is_connectivity() => {
                warn!(table = spec.name, "secondary write skipped: {}", e);
                SecondaryWrite::Unavailable {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                error!(table = spec.name, "secondary write failed: {}", e);
                SecondaryWrite::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn insert_secondary<R: Record>(&self, spec: &'static TableMigrationSpec, record: &R) -> Result<i64> {
        let row = record.to_row(self.resolver.precision());
        let row = self.resolver.to_secondary(spec, &row).await?;

        let mut scope = ForeignKeyScope::new(self.secondary.session().await?);
        scope.suspend_for(spec).await?;
        let inserted = scope.insert_row(spec, &row).await;
        // Restore even when the insert failed; its error wins.
        let restored = scope.restore().await;
        let id = inserted?;
        restored?;
        Ok(id)
    }

    /// Run the post-write check and decide whether the table has diverged.
    async fn check_table(&self, spec: &'static TableMigrationSpec, outcome: &mut WriteOutcome) -> bool {
        let report = match self.checker.check(spec.name).await {
            Ok(report) => report,
            Err(e) => {
                error!(table = spec.name, "consistency check failed: {}", e);
                outcome.errors.push(e.to_string());
                return false;
            }
        };

        let diverged = if report.incomplete {
            warn!(table = spec.name, "consistency check incomplete, no fallback");
            false
        } else {
            let signal = self.signal(spec.name, &report);
            outcome.mismatch_signal = Some(signal);
            signal > self.config.fallback_threshold
        };
        outcome.report = Some(report);
        diverged
    }

    fn signal(&self, table: &'static str, report: &ConsistencyReport) -> u64 {
        match self.config.mismatch_aggregation {
            MismatchAggregation::PerCheck => report.mismatches,
            MismatchAggregation::RunningTotal => match self.running_totals.lock() {
                Ok(mut totals) => {
                    let total = totals.entry(table).or_insert(0);
                    *total += report.mismatches;
                    *total
                }
                Err(_) => report.mismatches,
            },
        }
    }

    async fn write_primary<R: Record>(&self, spec: &'static TableMigrationSpec, record: &R) -> PrimaryWrite {
        let row = record.to_row(self.resolver.precision());
        let result = match self.primary.session().await {
            Ok(mut session) => session.insert_row(spec, &row).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(id) => PrimaryWrite::Inserted { id },
            Err(e) if e.is_integrity() => PrimaryWrite::AlreadyPresent {
                reason: e.to_string(),
            },
            Err(e) => {
                log_primary_failure(spec, &e);
                PrimaryWrite::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

fn log_primary_failure(spec: &TableMigrationSpec, err: &MigrateError) {
    match err {
        MigrateError::Connectivity {
            store: StoreRole::Primary,
            ..
        } => warn!(table = spec.name, "primary unavailable for fallback write: {}", err),
        _ => error!(table = spec.name, "primary fallback write failed: {}", err),
    }
}
