//! Application entities that flow through the online dual-write path.
//!
//! Each entity maps itself onto the exact column list of its table. Foreign
//! keys are carried as primary-store ids; the coordinator translates them
//! before writing to the secondary.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TimestampPrecision;
use crate::core::catalog;
use crate::core::{Row, SqlValue, TableMigrationSpec};
use crate::error::MigrateError;

/// An application entity that can be written to either store.
pub trait Record: Send + Sync {
    /// Table the record belongs to.
    fn spec(&self) -> &'static TableMigrationSpec;

    /// Id assigned by the primary store, if the record has been persisted.
    fn primary_id(&self) -> Option<i64>;

    /// Column values in spec order, enums as strings and timestamps truncated
    /// to `precision`. `row.id` is the primary id.
    fn to_row(&self, precision: TimestampPrecision) -> Row;
}

/// Timestamp value for a `created_at` column; missing values default to now.
fn created_at(value: Option<NaiveDateTime>, precision: TimestampPrecision) -> SqlValue {
    SqlValue::Timestamp(value.unwrap_or_else(|| Utc::now().naive_utc())).normalized(precision)
}

fn timestamp(value: Option<NaiveDateTime>, precision: TimestampPrecision) -> SqlValue {
    SqlValue::from(value).normalized(precision)
}

fn row(id: Option<i64>, values: Vec<SqlValue>) -> Row {
    Row { id, values }
}

/// Whether a category tracks spending or earnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CategoryType {
    Expense,
    Income,
}

impl fmt::Display for CategoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryType::Expense => write!(f, "EXPENSE"),
            CategoryType::Income => write!(f, "INCOME"),
        }
    }
}

impl FromStr for CategoryType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXPENSE" => Ok(CategoryType::Expense),
            "INCOME" => Ok(CategoryType::Income),
            other => Err(MigrateError::Config(format!(
                "unknown category type: {}",
                other
            ))),
        }
    }
}

/// How often a recurring transaction fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurringType {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl fmt::Display for RecurringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecurringType::Daily => "DAILY",
            RecurringType::Weekly => "WEEKLY",
            RecurringType::Monthly => "MONTHLY",
            RecurringType::Yearly => "YEARLY",
        };
        f.write_str(s)
    }
}

impl FromStr for RecurringType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(RecurringType::Daily),
            "WEEKLY" => Ok(RecurringType::Weekly),
            "MONTHLY" => Ok(RecurringType::Monthly),
            "YEARLY" => Ok(RecurringType::Yearly),
            other => Err(MigrateError::Config(format!(
                "unknown recurring type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Option<i64>,
    pub username: String,
    pub password: String,
    pub name: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub currency: Option<String>,
}

impl Record for User {
    fn spec(&self) -> &'static TableMigrationSpec {
        &catalog::USERS_SPEC
    }

    fn primary_id(&self) -> Option<i64> {
        self.id
    }

    fn to_row(&self, precision: TimestampPrecision) -> Row {
        row(
            self.id,
            vec![
                self.username.clone().into(),
                self.password.clone().into(),
                self.name.clone().into(),
                created_at(self.created_at, precision),
                self.currency.clone().into(),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetType {
    pub id: Option<i64>,
    pub created_at: Option<NaiveDateTime>,
}

impl Record for BudgetType {
    fn spec(&self) -> &'static TableMigrationSpec {
        &catalog::BUDGET_TYPES_SPEC
    }

    fn primary_id(&self) -> Option<i64> {
        self.id
    }

    fn to_row(&self, precision: TimestampPrecision) -> Row {
        row(self.id, vec![created_at(self.created_at, precision)])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Option<i64>,
    pub name: String,
    pub category_type: CategoryType,
    pub created_at: Option<NaiveDateTime>,
    pub user_id: i64,
}

impl Record for Category {
    fn spec(&self) -> &'static TableMigrationSpec {
        &catalog::CATEGORIES_SPEC
    }

    fn primary_id(&self) -> Option<i64> {
        self.id
    }

    fn to_row(&self, precision: TimestampPrecision) -> Row {
        row(
            self.id,
            vec![
                self.name.clone().into(),
                self.category_type.to_string().into(),
                created_at(self.created_at, precision),
                self.user_id.into(),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: Option<i64>,
    pub name: String,
    pub projected: f64,
    pub actual: f64,
    pub period_on: NaiveDate,
    pub created_at: Option<NaiveDateTime>,
    pub user_id: i64,
    pub category_id: i64,
    pub budget_type_id: Option<i64>,
}

impl Record for Budget {
    fn spec(&self) -> &'static TableMigrationSpec {
        &catalog::BUDGETS_SPEC
    }

    fn primary_id(&self) -> Option<i64> {
        self.id
    }

    fn to_row(&self, precision: TimestampPrecision) -> Row {
        row(
            self.id,
            vec![
                self.name.clone().into(),
                self.projected.into(),
                self.actual.into(),
                self.period_on.into(),
                created_at(self.created_at, precision),
                self.user_id.into(),
                self.category_id.into(),
                self.budget_type_id.into(),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recurring {
    pub id: Option<i64>,
    pub amount: f64,
    pub recurring_type: RecurringType,
    pub last_run_at: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
    pub budget_type_id: i64,
}

impl Record for Recurring {
    fn spec(&self) -> &'static TableMigrationSpec {
        &catalog::RECURRINGS_SPEC
    }

    fn primary_id(&self) -> Option<i64> {
        self.id
    }

    fn to_row(&self, precision: TimestampPrecision) -> Row {
        row(
            self.id,
            vec![
                self.amount.into(),
                self.recurring_type.to_string().into(),
                timestamp(self.last_run_at, precision),
                created_at(self.created_at, precision),
                self.budget_type_id.into(),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Option<i64>,
    pub name: String,
    pub amount: f64,
    pub remark: Option<String>,
    pub auto: bool,
    pub transaction_on: NaiveDateTime,
    pub created_at: Option<NaiveDateTime>,
    pub budget_id: i64,
    pub recurring_id: Option<i64>,
}

impl Record for Transaction {
    fn spec(&self) -> &'static TableMigrationSpec {
        &catalog::TRANSACTIONS_SPEC
    }

    fn primary_id(&self) -> Option<i64> {
        self.id
    }

    fn to_row(&self, precision: TimestampPrecision) -> Row {
        row(
            self.id,
            vec![
                self.name.clone().into(),
                self.amount.into(),
                self.remark.clone().into(),
                self.auto.into(),
                timestamp(Some(self.transaction_on), precision),
                created_at(self.created_at, precision),
                self.budget_id.into(),
                self.recurring_id.into(),
            ],
        )
    }
}
