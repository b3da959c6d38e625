//! Migration orchestrator - forklift runs, checks and administration.

mod plan;

pub use plan::{HealthCheckResult, MigrationPlan, PlannedTable};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::catalog;
use crate::core::{IdResolver, Store, TableMigrationSpec};
use crate::drivers;
use crate::error::{MigrateError, Result, StoreRole};
use crate::shadow::DualWriteCoordinator;
use crate::state::{MigrationRun, TableReport};
use crate::transfer::{ForkliftMigrator, TableCopyResult};
use crate::verify::{ConsistencyChecker, ConsistencyReport};

/// Administrative entry point: owns the store handles for one process and
/// the run state of forklift runs.
pub struct MigrationOrchestrator {
    config: Config,
    state_file: Option<PathBuf>,
    primary: Arc<dyn Store>,
    secondary: Arc<dyn Store>,
    resolver: Arc<IdResolver>,
    checker: Arc<ConsistencyChecker>,
}

impl MigrationOrchestrator {
    /// Create an orchestrator with pools for both configured stores.
    ///
    /// Pools connect lazily, so an unreachable store surfaces on first use.
    pub fn new(config: Config) -> Result<Self> {
        let primary = drivers::connect(&config.primary, StoreRole::Primary)?;
        let secondary = drivers::connect(&config.secondary, StoreRole::Secondary)?;
        Ok(Self::with_stores(config, primary, secondary))
    }

    /// Create an orchestrator over existing store handles.
    pub fn with_stores(config: Config, primary: Arc<dyn Store>, secondary: Arc<dyn Store>) -> Self {
        let resolver = Arc::new(IdResolver::new(
            primary.clone(),
            secondary.clone(),
            config.consistency.timestamp_precision,
        ));
        let checker = Arc::new(ConsistencyChecker::new(
            primary.clone(),
            secondary.clone(),
            resolver.clone(),
            &config.consistency,
            config.migration.fetch_size,
        ));

        Self {
            config,
            state_file: None,
            primary,
            secondary,
            resolver,
            checker,
        }
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A shadow-write coordinator sharing this orchestrator's stores and
    /// id cache.
    pub fn coordinator(&self) -> DualWriteCoordinator {
        DualWriteCoordinator::new(
            self.primary.clone(),
            self.secondary.clone(),
            self.resolver.clone(),
            self.checker.clone(),
            self.config.shadow.clone(),
        )
    }

    pub fn plan(&self) -> MigrationPlan {
        MigrationPlan::from_config(&self.config)
    }

    /// Create every missing secondary table, parents first.
    pub async fn init_schema(&self) -> Result<Vec<&'static str>> {
        let mut ensured = Vec::with_capacity(catalog::MIGRATION_ORDER.len());
        for spec in catalog::all() {
            self.secondary.ensure_table(spec).await?;
            ensured.push(spec.name);
        }
        info!(tables = ensured.len(), "secondary schema ready");
        Ok(ensured)
    }

    /// Test connectivity to both stores.
    pub async fn health_check(&self) -> HealthCheckResult {
        let (primary_connected, primary_latency_ms, primary_error) = probe(&self.primary).await;
        let (secondary_connected, secondary_latency_ms, secondary_error) =
            probe(&self.secondary).await;

        HealthCheckResult {
            primary_connected,
            primary_latency_ms,
            primary_error,
            secondary_connected,
            secondary_latency_ms,
            secondary_error,
            healthy: primary_connected && secondary_connected,
        }
    }

    /// Check one table, or every enabled table when `table` is `None`.
    ///
    /// With no table enabled, every table is checked.
    pub async fn check(&self, table: Option<&str>) -> Result<Vec<ConsistencyReport>> {
        let tables = match table {
            Some(name) => vec![catalog::lookup(name)?.name],
            None => {
                let enabled = self.config.migration.tables.enabled();
                if enabled.is_empty() {
                    catalog::MIGRATION_ORDER.to_vec()
                } else {
                    enabled
                }
            }
        };

        let mut reports = Vec::with_capacity(tables.len());
        for name in tables {
            reports.push(self.checker.check(name).await?);
        }
        Ok(reports)
    }

    /// Start a fresh forklift run over the enabled tables.
    pub async fn run(&self) -> Result<MigrationRun> {
        let run = MigrationRun::new(uuid::Uuid::new_v4().to_string(), self.config.hash());
        self.execute(run).await
    }

    /// Continue the run recorded in the state file, skipping tables it
    /// already completed. Starts a fresh run when the file does not exist.
    pub async fn resume(&self) -> Result<MigrationRun> {
        let path = self
            .state_file
            .as_ref()
            .ok_or_else(|| MigrateError::config("resume requires a state file"))?;

        if !path.exists() {
            info!("no state file at {:?}, starting a new run", path);
            return self.run().await;
        }

        let mut run = MigrationRun::load(path)?;
        run.validate_config(&self.config.hash())?;
        run.reopen();
        info!(
            run_id = %run.run_id,
            completed = ?run.tables_completed,
            "resuming from state file {:?}",
            path
        );
        self.execute(run).await
    }

    async fn execute(&self, mut run: MigrationRun) -> Result<MigrationRun> {
        let tables = self.enabled_tables()?;
        let started = Instant::now();

        run.start();
        self.save_state(&mut run)?;
        info!(run_id = %run.run_id, tables = ?self.config.migration.tables.enabled(), "starting forklift run");

        if let Err(e) = self.init_schema().await {
            if e.is_connectivity() {
                warn!("secondary schema not ensured: {}", e);
            } else {
                error!("secondary schema not ensured: {}", e);
                run.record_error(&e);
            }
        }

        let migrator = ForkliftMigrator::new(
            self.primary.clone(),
            self.secondary.clone(),
            self.resolver.clone(),
            self.config.migration.fetch_size,
            self.config.migration.suspend_foreign_keys,
        );
        for name in &run.tables_completed {
            if let Ok(spec) = catalog::lookup(name) {
                migrator.mark_copied(spec.name);
            }
        }

        for spec in tables {
            if run.is_table_completed(spec.name) {
                info!(table = spec.name, "already completed, skipping");
                continue;
            }

            run.begin_table(spec.name);
            self.save_state(&mut run)?;

            // A refusal stops only this table; its dependents get refused in turn.
            let copy = match migrator.copy_table(spec).await {
                Ok(copy) => copy,
                Err(e) => TableCopyResult::refused(spec.name, &e),
            };
            let report = self.finish_table(spec, copy, &mut run).await;
            run.record_table(report);
            self.save_state(&mut run)?;
        }

        run.finish();
        self.save_state(&mut run)?;

        info!(
            run_id = %run.run_id,
            status = ?run.status,
            tables_completed = run.tables_completed.len(),
            rows_copied = run.rows_copied,
            rows_skipped = run.rows_skipped,
            rows_failed = run.rows_failed,
            first_aborted_table = ?run.first_aborted_table,
            unexpected_errors = run.unexpected_errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "forklift run finished"
        );
        Ok(run)
    }

    /// Post-copy verification of a table that was not aborted.
    async fn finish_table(
        &self,
        spec: &'static TableMigrationSpec,
        copy: TableCopyResult,
        run: &mut MigrationRun,
    ) -> TableReport {
        let aborted = copy.is_aborted();
        let mut report = TableReport::new(copy);
        if aborted {
            return report;
        }

        match self.secondary.row_count(spec).await {
            Ok(n) => {
                info!(table = spec.name, secondary_rows = n, "secondary row count");
                report.secondary_rows = Some(n);
            }
            Err(e) if e.is_connectivity() => warn!(table = spec.name, "row count skipped: {}", e),
            Err(e) => {
                error!(table = spec.name, "row count failed: {}", e);
                run.record_error(&e);
            }
        }

        if self.config.migration.verify_references && spec.has_dependencies() {
            match self.secondary.count_orphans(spec).await {
                Ok(0) => report.orphans = Some(0),
                Ok(n) => {
                    warn!(table = spec.name, orphans = n, "rows with unresolved references");
                    report.orphans = Some(n);
                }
                Err(e) if e.is_connectivity() => {
                    warn!(table = spec.name, "reference check skipped: {}", e)
                }
                Err(e) => {
                    error!(table = spec.name, "reference check failed: {}", e);
                    run.record_error(&e);
                }
            }
        }

        if self.config.migration.check_after_copy {
            match self.checker.check(spec.name).await {
                Ok(consistency) => report.consistency = Some(consistency),
                Err(e) => {
                    error!(table = spec.name, "consistency check failed: {}", e);
                    run.record_error(&e);
                }
            }
        }

        report
    }

    fn enabled_tables(&self) -> Result<Vec<&'static TableMigrationSpec>> {
        let enabled = self.config.migration.tables.enabled();
        if enabled.is_empty() {
            return Err(MigrateError::config(
                "no tables enabled under migration.tables",
            ));
        }
        enabled.into_iter().map(catalog::lookup).collect()
    }

    fn save_state(&self, run: &mut MigrationRun) -> Result<()> {
        if let Some(ref path) = self.state_file {
            run.save(path)?;
        }
        Ok(())
    }

    /// Release both pools.
    pub async fn close(&self) {
        self.primary.close().await;
        self.secondary.close().await;
    }
}

async fn probe(store: &Arc<dyn Store>) -> (bool, u64, Option<String>) {
    let start = Instant::now();
    let result = store.test_connection().await;
    let latency = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => (true, latency, None),
        Err(e) => {
            warn!(store = %store.role(), "health check failed: {}", e);
            (false, latency, Some(e.to_string()))
        }
    }
}
