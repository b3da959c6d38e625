//! Dry-run plan and health reports.

use serde::Serialize;

use crate::config::Config;
use crate::core::catalog;

/// One table as a forklift run would treat it.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTable {
    /// Position in the copy order, starting at 1.
    pub order: usize,
    pub name: &'static str,
    pub enabled: bool,
    pub columns: Vec<&'static str>,
    pub natural_key: &'static [&'static str],
    pub depends_on: &'static [&'static str],
}

/// What `forklift` would do under a configuration, without touching a store.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub tables: Vec<PlannedTable>,
    pub fetch_size: usize,
    pub suspend_foreign_keys: bool,
    pub check_after_copy: bool,
    pub verify_references: bool,

    /// Enabled tables whose parents are not enabled. Their references can
    /// only resolve against rows already in the secondary.
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    pub fn from_config(config: &Config) -> Self {
        let switches = &config.migration.tables;
        let tables: Vec<PlannedTable> = catalog::all()
            .iter()
            .enumerate()
            .map(|(i, spec)| PlannedTable {
                order: i + 1,
                name: spec.name,
                enabled: switches.is_enabled(spec.name),
                columns: spec.column_names(),
                natural_key: spec.natural_key,
                depends_on: spec.depends_on,
            })
            .collect();

        let warnings = tables
            .iter()
            .filter(|t| t.enabled)
            .flat_map(|t| {
                t.depends_on
                    .iter()
                    .filter(|parent| !switches.is_enabled(parent))
                    .map(move |parent| {
                        format!("{} is enabled but its parent {} is not", t.name, parent)
                    })
            })
            .collect();

        Self {
            tables,
            fetch_size: config.migration.fetch_size,
            suspend_foreign_keys: config.migration.suspend_foreign_keys,
            check_after_copy: config.migration.check_after_copy,
            verify_references: config.migration.verify_references,
            warnings,
        }
    }

    /// Names of the enabled tables, in copy order.
    pub fn enabled(&self) -> Vec<&'static str> {
        self.tables
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.name)
            .collect()
    }
}

/// Result of a health check on both stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub primary_connected: bool,
    pub primary_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_error: Option<String>,
    pub secondary_connected: bool,
    pub secondary_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_error: Option<String>,
    pub healthy: bool,
}
