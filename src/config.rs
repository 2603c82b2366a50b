use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{DEFAULT_SLOT_MINUTES, EngineConfig};
use crate::limits::{MAX_SLOT_MINUTES, MIN_SLOT_MINUTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Process configuration, read once from `SLOTLOCK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub lease_ttl: Duration,
    pub sweep_interval: Duration,
    pub slot_minutes: u16,
    pub max_sessions: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub operator_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults;
    /// set but unparseable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value.trim().parse().map_err(|_| ConfigError {
                    var,
                    value,
                    reason: "not a valid number",
                }),
            }
        }

        let data_dir = PathBuf::from(lookup("SLOTLOCK_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let catalog_path = lookup("SLOTLOCK_CATALOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("catalog.json"));

        let lease_ttl_secs: u64 = parsed(&lookup, "SLOTLOCK_LEASE_TTL_SECS", 300)?;
        if lease_ttl_secs == 0 {
            return Err(ConfigError {
                var: "SLOTLOCK_LEASE_TTL_SECS",
                value: lease_ttl_secs.to_string(),
                reason: "must be positive",
            });
        }
        let sweep_secs: u64 = parsed(&lookup, "SLOTLOCK_SWEEP_INTERVAL_SECS", 60)?;
        if sweep_secs == 0 {
            return Err(ConfigError {
                var: "SLOTLOCK_SWEEP_INTERVAL_SECS",
                value: sweep_secs.to_string(),
                reason: "must be positive",
            });
        }
        let slot_minutes: u16 = parsed(&lookup, "SLOTLOCK_SLOT_MINUTES", DEFAULT_SLOT_MINUTES)?;
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&slot_minutes) {
            return Err(ConfigError {
                var: "SLOTLOCK_SLOT_MINUTES",
                value: slot_minutes.to_string(),
                reason: "out of range",
            });
        }

        let metrics_port = match lookup("SLOTLOCK_METRICS_PORT") {
            None => None,
            Some(_) => Some(parsed(&lookup, "SLOTLOCK_METRICS_PORT", 0u16)?),
        };

        Ok(Self {
            bind: lookup("SLOTLOCK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "SLOTLOCK_PORT", 8080)?,
            data_dir,
            catalog_path,
            lease_ttl: Duration::from_secs(lease_ttl_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            slot_minutes,
            max_sessions: parsed(&lookup, "SLOTLOCK_MAX_SESSIONS", 1024)?,
            compact_threshold: parsed(&lookup, "SLOTLOCK_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            operator_token: lookup("SLOTLOCK_OPERATOR_TOKEN").filter(|t| !t.is_empty()),
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            lease_ttl_ms: self.lease_ttl.as_millis() as i64,
            slot_minutes: self.slot_minutes,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.lease_ttl, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.slot_minutes, 30);
        assert_eq!(config.catalog_path, PathBuf::from("./data/catalog.json"));
        assert_eq!(config.wal_path(), PathBuf::from("./data/bookings.wal"));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.operator_token, None);
        assert_eq!(config.engine().lease_ttl_ms, 300_000);
    }

    #[test]
    fn overrides() {
        let config = from(&[
            ("SLOTLOCK_PORT", "9000"),
            ("SLOTLOCK_DATA_DIR", "/var/lib/slotlock"),
            ("SLOTLOCK_LEASE_TTL_SECS", "120"),
            ("SLOTLOCK_SLOT_MINUTES", "15"),
            ("SLOTLOCK_METRICS_PORT", "9100"),
            ("SLOTLOCK_OPERATOR_TOKEN", "s3cret"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.catalog_path, PathBuf::from("/var/lib/slotlock/catalog.json"));
        assert_eq!(config.engine().lease_ttl_ms, 120_000);
        assert_eq!(config.slot_minutes, 15);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.operator_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn rejects_bad_values() {
        let err = from(&[("SLOTLOCK_PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "SLOTLOCK_PORT");
        assert!(from(&[("SLOTLOCK_SLOT_MINUTES", "1")]).is_err());
        assert!(from(&[("SLOTLOCK_LEASE_TTL_SECS", "0")]).is_err());
        assert!(from(&[("SLOTLOCK_SWEEP_INTERVAL_SECS", "0")]).is_err());
    }
}
