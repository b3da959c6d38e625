//! Configuration type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::catalog;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source-of-truth store (PostgreSQL in production).
    pub primary: StoreConfig,

    /// Migration target (MySQL in production).
    pub secondary: StoreConfig,

    /// Forklift behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Online dual-write behavior.
    #[serde(default)]
    pub shadow: ShadowConfig,

    /// Row comparison rules shared by checks and the coordinator.
    #[serde(default)]
    pub consistency: ConsistencyConfig,
}

/// Database engine behind a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Postgres,
    Mysql,
}

impl StoreType {
    /// Default TCP port for the engine.
    pub fn default_port(self) -> u16 {
        match self {
            StoreType::Postgres => 5432,
            StoreType::Mysql => 3306,
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreType::Postgres => write!(f, "postgres"),
            StoreType::Mysql => write!(f, "mysql"),
        }
    }
}

/// SSL verification modes, matching PostgreSQL's `sslmode` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plain TCP.
    #[default]
    Disable,
    /// TLS without server certificate verification.
    Require,
    /// Verify the certificate chain.
    VerifyCa,
    /// Verify chain and hostname.
    VerifyFull,
}

impl SslMode {
    /// Check if this mode requires TLS.
    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }
}

/// Connection parameters for one store.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Engine type.
    pub r#type: StoreType,

    /// Database host.
    pub host: String,

    /// Database port (default depends on `type`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// TLS mode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Pool size (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl StoreConfig {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.r#type.default_port())
    }

    /// `host:port/database`, safe for logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port(), self.database)
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Per-table participation switches for the forklift.
///
/// Every table defaults to off; participation is never inferred.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSwitches {
    #[serde(default)]
    pub users: bool,
    #[serde(default)]
    pub budget_types: bool,
    #[serde(default)]
    pub categories: bool,
    #[serde(default)]
    pub budgets: bool,
    #[serde(default)]
    pub recurrings: bool,
    #[serde(default)]
    pub transactions: bool,
}

impl TableSwitches {
    /// All six tables enabled.
    pub fn all() -> Self {
        Self {
            users: true,
            budget_types: true,
            categories: true,
            budgets: true,
            recurrings: true,
            transactions: true,
        }
    }

    /// Whether `table` is switched on. Unknown names are off.
    pub fn is_enabled(&self, table: &str) -> bool {
        match table {
            catalog::USERS => self.users,
            catalog::BUDGET_TYPES => self.budget_types,
            catalog::CATEGORIES => self.categories,
            catalog::BUDGETS => self.budgets,
            catalog::RECURRINGS => self.recurrings,
            catalog::TRANSACTIONS => self.transactions,
            _ => false,
        }
    }

    /// Switch a table on or off by name. Returns false for unknown names.
    pub fn set(&mut self, table: &str, enabled: bool) -> bool {
        let slot = match table {
            catalog::USERS => &mut self.users,
            catalog::BUDGET_TYPES => &mut self.budget_types,
            catalog::CATEGORIES => &mut self.categories,
            catalog::BUDGETS => &mut self.budgets,
            catalog::RECURRINGS => &mut self.recurrings,
            catalog::TRANSACTIONS => &mut self.transactions,
            _ => return false,
        };
        *slot = enabled;
        true
    }

    /// Enabled table names in dependency order.
    pub fn enabled(&self) -> Vec<&'static str> {
        catalog::MIGRATION_ORDER
            .iter()
            .copied()
            .filter(|t| self.is_enabled(t))
            .collect()
    }
}

/// Forklift behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Tables to copy.
    #[serde(default)]
    pub tables: TableSwitches,

    /// Rows fetched per cursor round trip (default: 1000).
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// Suspend secondary FK checks while copying dependent tables (default: true).
    #[serde(default = "default_true")]
    pub suspend_foreign_keys: bool,

    /// Run a consistency check after each table copy (default: true).
    #[serde(default = "default_true")]
    pub check_after_copy: bool,

    /// Count orphaned references after each table copy (default: true).
    #[serde(default = "default_true")]
    pub verify_references: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            tables: TableSwitches::default(),
            fetch_size: default_fetch_size(),
            suspend_foreign_keys: true,
            check_after_copy: true,
            verify_references: true,
        }
    }
}

/// How the coordinator turns consistency reports into a divergence signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchAggregation {
    /// Use the mismatches of the fresh check only.
    #[default]
    PerCheck,
    /// Sum mismatches of every completed check per table since startup.
    RunningTotal,
}

/// When the coordinator also writes the record into the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryFallback {
    /// Only when the divergence signal exceeds `fallback_threshold`.
    #[default]
    OnDivergence,
    /// After every shadow write.
    Always,
    /// Never; the caller's own persistence is the only primary write.
    Never,
}

/// Online dual-write configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Issue shadow writes at all (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mismatch count above which the record is also persisted to the primary (default: 100).
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: u64,

    /// Divergence signal source (default: per_check).
    #[serde(default)]
    pub mismatch_aggregation: MismatchAggregation,

    /// Primary write policy (default: on_divergence).
    #[serde(default)]
    pub primary_fallback: PrimaryFallback,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_threshold: default_fallback_threshold(),
            mismatch_aggregation: MismatchAggregation::default(),
            primary_fallback: PrimaryFallback::default(),
        }
    }
}

/// Precision timestamps are truncated to before writing or comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPrecision {
    /// Whole seconds (MySQL `DATETIME` without fractional digits).
    #[default]
    Seconds,
    Millis,
    Micros,
}

/// Row comparison configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Shared timestamp precision (default: seconds).
    #[serde(default)]
    pub timestamp_precision: TimestampPrecision,

    /// Absolute tolerance for floating columns (default: 1e-6).
    #[serde(default = "default_float_epsilon")]
    pub float_epsilon: f64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            timestamp_precision: TimestampPrecision::default(),
            float_epsilon: default_float_epsilon(),
        }
    }
}

// Default value functions for serde
fn default_max_connections() -> usize {
    4
}

fn default_fetch_size() -> usize {
    1000
}

fn default_fallback_threshold() -> u64 {
    100
}

fn default_float_epsilon() -> f64 {
    1e-6
}

fn default_true() -> bool {
    true
}
