//! Consistency report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result of comparing one table across both stores.
///
/// Produced fresh by every check; nothing accumulates between checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub table: String,

    /// Primary rows examined.
    pub rows_compared: u64,

    /// Primary rows that are missing from the secondary or differ in at
    /// least one column.
    pub mismatches: u64,

    /// Primary rows with no natural-key match in the secondary.
    pub missing_in_secondary: u64,

    /// The check was cut short by a connectivity failure; counters are zero.
    pub incomplete: bool,

    /// Differing rows per column, for diagnostics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_mismatches: BTreeMap<String, u64>,
}

impl ConsistencyReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows_compared: 0,
            mismatches: 0,
            missing_in_secondary: 0,
            incomplete: false,
            column_mismatches: BTreeMap::new(),
        }
    }

    /// A report for a check that could not finish.
    pub fn incomplete(table: impl Into<String>) -> Self {
        Self {
            incomplete: true,
            ..Self::new(table)
        }
    }

    /// Complete and without divergence.
    pub fn is_consistent(&self) -> bool {
        !self.incomplete && self.mismatches == 0
    }

    pub(crate) fn record_missing(&mut self) {
        self.missing_in_secondary += 1;
        self.mismatches += 1;
    }

    pub(crate) fn record_diff(&mut self, columns: &[&str]) {
        self.mismatches += 1;
        for column in columns {
            *self.column_mismatches.entry((*column).to_string()).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_counts_as_mismatch() {
        let mut report = ConsistencyReport::new("users");
        report.record_missing();
        report.record_diff(&["name", "currency"]);
        report.record_diff(&["name"]);

        assert_eq!(report.mismatches, 3);
        assert_eq!(report.missing_in_secondary, 1);
        assert_eq!(report.column_mismatches.get("name"), Some(&2));
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_incomplete_is_zeroed() {
        let report = ConsistencyReport::incomplete("budgets");
        assert!(report.incomplete);
        assert_eq!(report.rows_compared, 0);
        assert_eq!(report.mismatches, 0);
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_serializes_without_empty_column_map() {
        let json = serde_json::to_value(ConsistencyReport::new("users")).unwrap();
        assert!(json.get("column_mismatches").is_none());
        assert_eq!(json["incomplete"], false);
    }
}
