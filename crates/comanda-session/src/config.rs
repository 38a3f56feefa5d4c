//! Engine configuration.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use comanda_db::DbConfig;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// How a settle records payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    /// Mark every pending order of the session as paid.
    #[default]
    MarkPaid,
    /// Additionally write one settlement order carrying the frozen total.
    Consolidated,
}

impl std::str::FromStr for SettlementMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mark_paid" => Ok(SettlementMode::MarkPaid),
            "consolidated" => Ok(SettlementMode::Consolidated),
            _ => Err(ConfigError::InvalidValue("COMANDA_SETTLEMENT_MODE".to_string())),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database file (or `:memory:`)
    pub database_path: PathBuf,

    /// Pool size
    pub max_connections: u32,

    /// How long a writer waits on another writer's lock
    pub busy_timeout: Duration,

    /// Deadline for a whole operation; expiry rolls the transaction back
    pub operation_timeout: Duration,

    /// Settlement mode used when a request does not pick one
    pub settlement_mode: SettlementMode,

    /// Orders placed by waiters wait for a cashier's approval
    pub waiter_orders_need_approval: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: PathBuf::from("./comanda.db"),
            max_connections: 5,
            busy_timeout: Duration::from_millis(5000),
            operation_timeout: Duration::from_millis(10_000),
            settlement_mode: SettlementMode::MarkPaid,
            waiter_orders_need_approval: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup (environment, file, test map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();

        let config = EngineConfig {
            database_path: lookup("COMANDA_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),

            max_connections: lookup("COMANDA_MAX_CONNECTIONS")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| ConfigError::InvalidValue("COMANDA_MAX_CONNECTIONS".to_string()))?
                .unwrap_or(defaults.max_connections),

            busy_timeout: parse_millis(&lookup, "COMANDA_BUSY_TIMEOUT_MS")?
                .unwrap_or(defaults.busy_timeout),

            operation_timeout: parse_millis(&lookup, "COMANDA_OPERATION_TIMEOUT_MS")?
                .unwrap_or(defaults.operation_timeout),

            settlement_mode: lookup("COMANDA_SETTLEMENT_MODE")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(defaults.settlement_mode),

            waiter_orders_need_approval: lookup("COMANDA_WAITER_ORDERS_NEED_APPROVAL")
                .map(|v| parse_bool(&v))
                .transpose()?
                .unwrap_or(defaults.waiter_orders_need_approval),
        };

        if config.max_connections == 0 {
            return Err(ConfigError::InvalidValue("COMANDA_MAX_CONNECTIONS".to_string()));
        }
        if config.operation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "COMANDA_OPERATION_TIMEOUT_MS".to_string(),
            ));
        }

        Ok(config)
    }

    /// Database settings derived from this configuration.
    pub fn db_config(&self) -> DbConfig {
        if self.database_path.as_os_str() == ":memory:" {
            return DbConfig::in_memory().busy_timeout(self.busy_timeout);
        }
        DbConfig::new(&self.database_path)
            .max_connections(self.max_connections)
            .busy_timeout(self.busy_timeout)
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(
            "COMANDA_WAITER_ORDERS_NEED_APPROVAL".to_string(),
        )),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_path, PathBuf::from("./comanda.db"));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.busy_timeout, Duration::from_millis(5000));
        assert_eq!(config.operation_timeout, Duration::from_millis(10_000));
        assert_eq!(config.settlement_mode, SettlementMode::MarkPaid);
        assert!(!config.waiter_orders_need_approval);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("COMANDA_DATABASE_PATH", "/data/floor.db"),
            ("COMANDA_MAX_CONNECTIONS", "8"),
            ("COMANDA_BUSY_TIMEOUT_MS", "250"),
            ("COMANDA_OPERATION_TIMEOUT_MS", "1500"),
            ("COMANDA_SETTLEMENT_MODE", "consolidated"),
            ("COMANDA_WAITER_ORDERS_NEED_APPROVAL", "yes"),
        ]))
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/data/floor.db"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.operation_timeout, Duration::from_millis(1500));
        assert_eq!(config.settlement_mode, SettlementMode::Consolidated);
        assert!(config.waiter_orders_need_approval);

        let db = config.db_config();
        assert_eq!(db.max_connections, 8);
        assert_eq!(db.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values() {
        let err = EngineConfig::from_lookup(lookup(&[("COMANDA_MAX_CONNECTIONS", "many")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for COMANDA_MAX_CONNECTIONS");

        assert!(EngineConfig::from_lookup(lookup(&[("COMANDA_SETTLEMENT_MODE", "cash")])).is_err());
        assert!(
            EngineConfig::from_lookup(lookup(&[("COMANDA_OPERATION_TIMEOUT_MS", "0")])).is_err()
        );
        assert!(EngineConfig::from_lookup(lookup(&[(
            "COMANDA_WAITER_ORDERS_NEED_APPROVAL",
            "maybe"
        )]))
        .is_err());
    }
}
