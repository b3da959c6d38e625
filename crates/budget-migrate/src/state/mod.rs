//! Forklift run state, with a signed JSON state file for resume.

use std::path::Path;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::error::{MigrateError, Result};
use crate::transfer::TableCopyResult;
use crate::verify::ConsistencyReport;

type HmacSha256 = Hmac<Sha256>;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    /// Every enabled table was copied without a connectivity abort.
    Completed,
    /// At least one table was aborted.
    PartialFailure,
}

/// Everything recorded for one table of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReport {
    pub copy: TableCopyResult,

    /// Post-copy check, when enabled and not failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyReport>,

    /// Rows with a dangling reference after foreign key checks were restored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphans: Option<u64>,

    /// Secondary row count once the copy finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_rows: Option<u64>,
}

impl TableReport {
    pub fn new(copy: TableCopyResult) -> Self {
        Self {
            copy,
            consistency: None,
            orphans: None,
            secondary_rows: None,
        }
    }
}

/// State of one forklift run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    pub status: RunStatus,

    /// Table being copied right now.
    #[serde(default)]
    pub current_table: Option<String>,

    /// Tables copied to the end without an abort, in copy order.
    #[serde(default)]
    pub tables_completed: Vec<String>,

    #[serde(default)]
    pub rows_copied: u64,
    #[serde(default)]
    pub rows_skipped: u64,
    #[serde(default)]
    pub rows_failed: u64,

    /// First table stopped by a connectivity failure.
    #[serde(default)]
    pub first_aborted_table: Option<String>,

    /// Per-table reports in copy order. A resumed run appends.
    #[serde(default)]
    pub tables: Vec<TableReport>,

    /// Unexpected store errors from copies, checks and reference counts.
    #[serde(default)]
    pub unexpected_errors: Vec<String>,

    /// HMAC-SHA256 over the serialized run (without this field), keyed by
    /// `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationRun {
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::NotStarted,
            current_table: None,
            tables_completed: Vec::new(),
            rows_copied: 0,
            rows_skipped: 0,
            rows_failed: 0,
            first_aborted_table: None,
            tables: Vec::new(),
            unexpected_errors: Vec::new(),
            hmac: None,
        }
    }

    /// Enter `Running`.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.completed_at = None;
    }

    pub fn begin_table(&mut self, table: &str) {
        self.current_table = Some(table.to_string());
    }

    /// Fold a finished table into the run.
    pub fn record_table(&mut self, report: TableReport) {
        let copy = &report.copy;
        self.rows_copied += copy.rows_copied;
        self.rows_skipped += copy.rows_skipped;
        self.rows_failed += copy.rows_failed;
        self.unexpected_errors.extend(copy.errors.iter().cloned());

        if copy.is_aborted() {
            if self.first_aborted_table.is_none() {
                self.first_aborted_table = Some(copy.table.clone());
            }
        } else if copy.is_complete() && !self.is_table_completed(&copy.table) {
            self.tables_completed.push(copy.table.clone());
        }

        self.current_table = None;
        self.tables.push(report);
    }

    /// Record an unexpected error raised outside a table copy.
    pub fn record_error(&mut self, error: &MigrateError) {
        self.unexpected_errors.push(error.to_string());
    }

    /// Leave `Running`: `Completed` unless a table was aborted.
    pub fn finish(&mut self) {
        self.current_table = None;
        self.status = if self.first_aborted_table.is_some() {
            RunStatus::PartialFailure
        } else {
            RunStatus::Completed
        };
        self.completed_at = Some(Utc::now());
    }

    /// Prepare a loaded run for another pass over the remaining tables.
    ///
    /// The abort marker is cleared; aborted tables are copied again.
    pub fn reopen(&mut self) {
        self.first_aborted_table = None;
        self.start();
    }

    pub fn is_table_completed(&self, table: &str) -> bool {
        self.tables_completed.iter().any(|t| t == table)
    }

    /// Report of the last copy of `table` in this run.
    pub fn table_report(&self, table: &str) -> Option<&TableReport> {
        self.tables.iter().rev().find(|r| r.copy.table == table)
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a state file and verify its signature.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let run: Self = serde_json::from_str(&content)?;

        match &run.hmac {
            Some(stored) => {
                if stored != &run.compute_hmac()? {
                    return Err(MigrateError::State(
                        "state file integrity check failed: HMAC mismatch".to_string(),
                    ));
                }
            }
            None => warn!("state file has no HMAC signature, integrity cannot be verified"),
        }

        Ok(run)
    }

    /// Sign and save atomically (temp file, then rename).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Refuse to resume a run started under a different configuration.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn copy(table: &str, copied: u64, skipped: u64) -> TableCopyResult {
        TableCopyResult {
            table: table.to_string(),
            rows_copied: copied,
            rows_skipped: skipped,
            ..TableCopyResult::default()
        }
    }

    #[test]
    fn test_state_machine_completed() {
        let mut run = MigrationRun::new("run-1".into(), "hash".into());
        assert_eq!(run.status, RunStatus::NotStarted);

        run.start();
        run.begin_table("users");
        assert_eq!(run.current_table.as_deref(), Some("users"));
        run.record_table(TableReport::new(copy("users", 3, 0)));
        run.begin_table("categories");
        run.record_table(TableReport::new(copy("categories", 2, 1)));
        run.finish();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.tables_completed, vec!["users", "categories"]);
        assert_eq!(run.rows_copied, 5);
        assert_eq!(run.rows_skipped, 1);
        assert!(run.current_table.is_none());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_abort_makes_partial_failure() {
        let mut run = MigrationRun::new("run-1".into(), "hash".into());
        run.start();
        let mut aborted = copy("budgets", 1, 0);
        aborted.aborted = Some("connection refused".into());
        run.record_table(TableReport::new(copy("users", 1, 0)));
        run.record_table(TableReport::new(aborted.clone()));
        aborted.table = "transactions".into();
        run.record_table(TableReport::new(aborted));
        run.finish();

        assert_eq!(run.status, RunStatus::PartialFailure);
        assert_eq!(run.first_aborted_table.as_deref(), Some("budgets"));
        assert!(!run.is_table_completed("budgets"));
        assert!(run.is_table_completed("users"));
    }

    #[test]
    fn test_truncated_table_is_not_completed() {
        let mut run = MigrationRun::new("run-1".into(), "hash".into());
        run.start();
        let mut truncated = copy("users", 3, 0);
        truncated.incomplete = true;
        truncated.errors.push("cursor failed".into());
        run.record_table(TableReport::new(truncated));
        run.finish();

        assert_eq!(run.status, RunStatus::Completed);
        assert!(!run.is_table_completed("users"));
        assert!(run.first_aborted_table.is_none());
        assert_eq!(run.rows_copied, 3);
        assert_eq!(run.unexpected_errors.len(), 1);
    }

    #[test]
    fn test_unexpected_errors_are_collected() {
        let mut run = MigrationRun::new("run-1".into(), "hash".into());
        let mut result = copy("users", 0, 0);
        result.rows_failed = 1;
        result.errors.push("syntax error".into());
        run.record_table(TableReport::new(result));
        run.record_error(&MigrateError::unexpected("users", "check failed"));

        assert_eq!(run.rows_failed, 1);
        assert_eq!(run.unexpected_errors.len(), 2);
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut run = MigrationRun::new("run-1".into(), "abc123".into());
        run.start();
        let mut report = TableReport::new(copy("users", 2, 0));
        report.consistency = Some(ConsistencyReport::new("users"));
        report.orphans = Some(0);
        run.record_table(report);

        let file = NamedTempFile::new().unwrap();
        run.save(file.path()).unwrap();

        let loaded = MigrationRun::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.tables_completed, vec!["users"]);
        assert_eq!(loaded.table_report("users"), run.table_report("users"));
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let mut run = MigrationRun::new("run-1".into(), "abc123".into());
        run.record_table(TableReport::new(copy("users", 2, 0)));
        let file = NamedTempFile::new().unwrap();
        run.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        std::fs::write(file.path(), content.replace("\"rows_copied\": 2", "\"rows_copied\": 9")).unwrap();

        let err = MigrationRun::load(file.path()).unwrap_err();
        assert!(matches!(err, MigrateError::State(_)));
    }

    #[test]
    fn test_config_validation() {
        let run = MigrationRun::new("run-1".into(), "abc123".into());
        assert!(run.validate_config("abc123").is_ok());
        assert!(matches!(
            run.validate_config("other"),
            Err(MigrateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_state_file_is_pretty_json() {
        let mut run = MigrationRun::new("run-1".into(), "hash".into());
        let file = NamedTempFile::new().unwrap();
        run.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["status"], "not_started");
        assert!(content.contains('\n'));
    }

    #[test]
    fn test_reopen_clears_abort() {
        let mut run = MigrationRun::new("run-1".into(), "hash".into());
        let mut aborted = copy("users", 0, 0);
        aborted.aborted = Some("down".into());
        run.record_table(TableReport::new(aborted));
        run.finish();
        assert_eq!(run.status, RunStatus::PartialFailure);

        run.reopen();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.first_aborted_table.is_none());
    }
}
