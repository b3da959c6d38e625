//! Configuration validation.

use super::{Config, StoreConfig};
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_store("primary", &config.primary)?;
    validate_store("secondary", &config.secondary)?;

    // Cannot migrate to the same database
    if config.primary.r#type == config.secondary.r#type
        && config.primary.host == config.secondary.host
        && config.primary.port() == config.secondary.port()
        && config.primary.database == config.secondary.database
    {
        return Err(MigrateError::Config(
            "primary and secondary cannot be the same database".into(),
        ));
    }

    if config.migration.fetch_size == 0 {
        return Err(MigrateError::Config(
            "migration.fetch_size must be at least 1".into(),
        ));
    }

    let epsilon = config.consistency.float_epsilon;
    if !epsilon.is_finite() || epsilon < 0.0 {
        return Err(MigrateError::Config(format!(
            "consistency.float_epsilon must be a finite, non-negative number, got {}",
            epsilon
        )));
    }

    Ok(())
}

fn validate_store(label: &str, store: &StoreConfig) -> Result<()> {
    if store.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", label)));
    }
    if store.database.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.database is required",
            label
        )));
    }
    if store.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", label)));
    }
    if store.max_connections == 0 {
        return Err(MigrateError::Config(format!(
            "{}.max_connections must be at least 1",
            label
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ConsistencyConfig, MigrationConfig, ShadowConfig, SslMode, StoreType, TableSwitches,
    };

    fn valid_config() -> Config {
        Config {
            primary: StoreConfig {
                r#type: StoreType::Postgres,
                host: "localhost".to_string(),
                port: None,
                database: "345BudgetApp".to_string(),
                user: "postgres".to_string(),
                password: "postgres".to_string(),
                ssl_mode: SslMode::Disable,
                max_connections: 4,
            },
            secondary: StoreConfig {
                r#type: StoreType::Mysql,
                host: "localhost".to_string(),
                port: None,
                database: "345BudgetApp".to_string(),
                user: "root".to_string(),
                password: "root".to_string(),
                ssl_mode: SslMode::Disable,
                max_connections: 4,
            },
            migration: MigrationConfig {
                tables: TableSwitches::all(),
                ..MigrationConfig::default()
            },
            shadow: ShadowConfig::default(),
            consistency: ConsistencyConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_primary_host() {
        let mut config = valid_config();
        config.primary.host = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("primary.host"));
    }

    #[test]
    fn test_missing_secondary_user() {
        let mut config = valid_config();
        config.secondary.user = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.secondary = config.primary.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_host_different_engine_allowed() {
        // Same host and database name, but PostgreSQL and MySQL listen on different ports.
        let config = valid_config();
        assert_eq!(config.primary.host, config.secondary.host);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_fetch_size_rejected() {
        let mut config = valid_config();
        config.migration.fetch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_negative_epsilon_rejected() {
        let mut config = valid_config();
        config.consistency.float_epsilon = -0.1;
        assert!(validate(&config).is_err());
        config.consistency.float_epsilon = f64::NAN;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_store_config_debug_redacts_password() {
        let mut config = valid_config();
        config.primary.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.primary);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }
}
