use std::env;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Nats => write!(f, "nats"),
            BusType::InMemory => write!(f, "inmemory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Label for this process in startup logs
    ///
    /// Does not change published events: each event contract fixes its own
    /// `source`, so renaming the process never alters the audit trail.
    pub service_name: String,
    pub bus_type: BusType,
    pub nats_url: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = lookup("SERVICE_NAME").unwrap_or_else(|| "IdentityService".to_string());

        let bus_type = match lookup("BUS_TYPE")
            .unwrap_or_else(|| "nats".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                return Err(format!(
                    "Invalid BUS_TYPE: {}. Must be 'inmemory' or 'nats'",
                    other
                ))
            }
        };

        let nats_url = lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| "DATABASE_URL must be set".to_string())?;

        let db_max_connections: u32 = lookup("DB_MAX_CONNECTIONS")
            .unwrap_or_else(|| "5".to_string())
            .parse()
            .map_err(|_| "DB_MAX_CONNECTIONS must be a valid u32".to_string())?;

        let shutdown_grace_secs: u64 = lookup("SHUTDOWN_GRACE_SECS")
            .unwrap_or_else(|| "10".to_string())
            .parse()
            .map_err(|_| "SHUTDOWN_GRACE_SECS must be a valid u64".to_string())?;

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Config {
            service_name,
            bus_type,
            nats_url,
            database_url,
            db_max_connections,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("DATABASE_URL", "postgres://localhost/identity")]).unwrap();

        assert_eq!(cfg.service_name, "IdentityService");
        assert_eq!(cfg.bus_type, BusType::Nats);
        assert_eq!(cfg.nats_url, "nats://localhost:4222");
        assert_eq!(cfg.db_max_connections, 5);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(10));
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://db/identity"),
            ("BUS_TYPE", "InMemory"),
            ("DB_MAX_CONNECTIONS", "2"),
            ("SHUTDOWN_GRACE_SECS", "3"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(cfg.bus_type, BusType::InMemory);
        assert_eq!(cfg.db_max_connections, 2);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(3));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn test_service_name_is_only_a_label() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://db/identity"),
            ("SERVICE_NAME", "identity-eu-1"),
        ])
        .unwrap();

        assert_eq!(cfg.service_name, "identity-eu-1");
        assert_eq!(crate::contracts::USER_EVENT_SOURCE, "IdentityService");
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(config(&[]).unwrap_err(), "DATABASE_URL must be set");
        assert!(config(&[("DATABASE_URL", "x"), ("BUS_TYPE", "kafka")])
            .unwrap_err()
            .contains("Invalid BUS_TYPE"));
        assert!(config(&[("DATABASE_URL", "x"), ("DB_MAX_CONNECTIONS", "many")]).is_err());
    }
}
