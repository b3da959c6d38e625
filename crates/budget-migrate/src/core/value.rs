//! Row values exchanged between stores, and the type-aware comparison the
//! consistency checker applies to them.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use super::schema::ColumnType;
use crate::config::TimestampPrecision;

/// A single column value.
///
/// Values are owned: rows cross task boundaries through the read channel and
/// outlive the driver buffers they were decoded from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer payload, used for foreign key ids.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Truncate timestamps to `precision`; other values are returned unchanged.
    #[must_use]
    pub fn normalized(self, precision: TimestampPrecision) -> Self {
        match self {
            SqlValue::Timestamp(ts) => SqlValue::Timestamp(truncate_timestamp(ts, precision)),
            other => other,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::Int(v) => write!(f, "{}", v),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "'{}'", v),
            SqlValue::Date(v) => write!(f, "{}", v),
            SqlValue::Timestamp(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One row of a migrated table.
///
/// `id` is the store-local surrogate key (absent for rows not yet written);
/// `values` follow the table's column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: Option<i64>,
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { id: None, values }
    }

    pub fn with_id(id: i64, values: Vec<SqlValue>) -> Self {
        Self {
            id: Some(id),
            values,
        }
    }

    /// Values at the given positions, in that order.
    pub fn project(&self, indices: &[usize]) -> Vec<SqlValue> {
        indices
            .iter()
            .map(|&i| self.values.get(i).cloned().unwrap_or(SqlValue::Null))
            .collect()
    }
}

/// A batch of rows streamed from a store.
pub type Batch = Vec<Row>;

/// Truncate a timestamp to the given precision.
pub fn truncate_timestamp(ts: NaiveDateTime, precision: TimestampPrecision) -> NaiveDateTime {
    let nanos = ts.nanosecond();
    let kept = match precision {
        TimestampPrecision::Seconds => 0,
        TimestampPrecision::Millis => nanos - nanos % 1_000_000,
        TimestampPrecision::Micros => nanos - nanos % 1_000,
    };
    ts.with_nanosecond(kept).unwrap_or(ts)
}

/// Comparison rules shared by every consistency check.
#[derive(Debug, Clone, Copy)]
pub struct ValueComparator {
    pub precision: TimestampPrecision,
    pub float_epsilon: f64,
}

impl ValueComparator {
    pub fn new(precision: TimestampPrecision, float_epsilon: f64) -> Self {
        Self {
            precision,
            float_epsilon,
        }
    }

    /// Compare two values of a column with semantic type `ty`.
    ///
    /// NULL equals only NULL. Timestamps compare after truncation, floats
    /// within the epsilon, everything else exactly. Integers and floats are
    /// accepted on either side of a float column since engines disagree on
    /// how they report `DOUBLE` literals.
    pub fn values_equal(&self, ty: ColumnType, a: &SqlValue, b: &SqlValue) -> bool {
        match (a, b) {
            (SqlValue::Null, SqlValue::Null) => true,
            (SqlValue::Null, _) | (_, SqlValue::Null) => false,
            (SqlValue::Timestamp(x), SqlValue::Timestamp(y)) => {
                truncate_timestamp(*x, self.precision) == truncate_timestamp(*y, self.precision)
            }
            _ if ty == ColumnType::Float => match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => (x - y).abs() <= self.float_epsilon,
                _ => false,
            },
            (SqlValue::Bool(x), SqlValue::Int(y)) | (SqlValue::Int(y), SqlValue::Bool(x))
                if ty == ColumnType::Boolean =>
            {
                (*y != 0) == *x
            }
            _ => a == b,
        }
    }
}

fn as_f64(v: &SqlValue) -> Option<f64> {
    match v {
        SqlValue::Float(f) => Some(*f),
        SqlValue::Int(i) => Some(*i as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[test]
    fn test_truncate_timestamp() {
        let t = ts("2024-03-01 10:20:30.123456789");
        assert_eq!(
            truncate_timestamp(t, TimestampPrecision::Seconds),
            ts("2024-03-01 10:20:30.0")
        );
        assert_eq!(
            truncate_timestamp(t, TimestampPrecision::Millis),
            ts("2024-03-01 10:20:30.123")
        );
        assert_eq!(
            truncate_timestamp(t, TimestampPrecision::Micros),
            ts("2024-03-01 10:20:30.123456")
        );
    }

    #[test]
    fn test_timestamp_compare_uses_precision() {
        let cmp = ValueComparator::new(TimestampPrecision::Seconds, 1e-6);
        let a = SqlValue::Timestamp(ts("2024-03-01 10:20:30.999"));
        let b = SqlValue::Timestamp(ts("2024-03-01 10:20:30.000"));
        assert!(cmp.values_equal(ColumnType::Timestamp, &a, &b));

        let cmp = ValueComparator::new(TimestampPrecision::Millis, 1e-6);
        assert!(!cmp.values_equal(ColumnType::Timestamp, &a, &b));
    }

    #[test]
    fn test_float_epsilon() {
        let cmp = ValueComparator::new(TimestampPrecision::Seconds, 1e-6);
        assert!(cmp.values_equal(
            ColumnType::Float,
            &SqlValue::Float(10.0),
            &SqlValue::Float(10.000_000_1)
        ));
        assert!(!cmp.values_equal(
            ColumnType::Float,
            &SqlValue::Float(10.0),
            &SqlValue::Float(10.01)
        ));
        assert!(cmp.values_equal(ColumnType::Float, &SqlValue::Int(3), &SqlValue::Float(3.0)));
    }

    #[test]
    fn test_null_equals_only_null() {
        let cmp = ValueComparator::new(TimestampPrecision::Seconds, 1e-6);
        assert!(cmp.values_equal(ColumnType::Text, &SqlValue::Null, &SqlValue::Null));
        assert!(!cmp.values_equal(ColumnType::Text, &SqlValue::Null, &"".into()));
        assert!(!cmp.values_equal(ColumnType::Integer, &SqlValue::Int(0), &SqlValue::Null));
    }

    #[test]
    fn test_text_and_enum_exact() {
        let cmp = ValueComparator::new(TimestampPrecision::Seconds, 1e-6);
        assert!(cmp.values_equal(ColumnType::Enum, &"EXPENSE".into(), &"EXPENSE".into()));
        assert!(!cmp.values_equal(ColumnType::Enum, &"EXPENSE".into(), &"expense".into()));
    }

    #[test]
    fn test_boolean_accepts_tinyint() {
        let cmp = ValueComparator::new(TimestampPrecision::Seconds, 1e-6);
        assert!(cmp.values_equal(ColumnType::Boolean, &SqlValue::Bool(true), &SqlValue::Int(1)));
        assert!(!cmp.values_equal(ColumnType::Boolean, &SqlValue::Int(0), &SqlValue::Bool(true)));
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<String> = None;
        assert_eq!(SqlValue::from(none), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(5i64)), SqlValue::Int(5));
    }

    #[test]
    fn test_row_project() {
        let row = Row::with_id(7, vec!["a".into(), SqlValue::Int(1), SqlValue::Null]);
        assert_eq!(row.project(&[1, 0]), vec![SqlValue::Int(1), "a".into()]);
    }
}
