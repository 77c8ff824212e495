//! Optional TOML configuration file: resolves a short alias to
//! `(host, port, database)` and supplies defaults for load/chunk limits.
//! CLI flags always override file values, field by field, mirroring the
//! teacher's own `read_config` + override-merge pattern in
//! `common::config`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GhostError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAlias {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GhostConfig {
    /// Short name -> connection target, so `--host prod-replica-1` can be
    /// written instead of a full host/port/database triple.
    #[serde(default)]
    pub aliases: HashMap<String, HostAlias>,

    #[serde(default)]
    pub chunk_size: Option<u32>,
    #[serde(default)]
    pub dml_batch_size: Option<u32>,
    #[serde(default)]
    pub max_lag_millis: Option<u64>,
    #[serde(default)]
    pub nice_ratio: Option<f64>,
    #[serde(default)]
    pub default_retries: Option<u32>,
    #[serde(default)]
    pub cut_over_lock_timeout_seconds: Option<u32>,
    #[serde(default)]
    pub max_load: Option<String>,
    #[serde(default)]
    pub critical_load: Option<String>,
}

impl GhostConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GhostError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| GhostError::ConfigError(e.to_string()))
    }

    pub fn resolve_alias(&self, name: &str) -> Option<&HostAlias> {
        self.aliases.get(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_alias_table_and_defaults() {
        let toml = r#"
            chunk_size = 500
            nice_ratio = 1.5

            [aliases.prod]
            host = "10.0.0.5"
            port = 3306
            database = "orders"
        "#;
        let cfg: GhostConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.chunk_size, Some(500));
        let alias = cfg.resolve_alias("prod").unwrap();
        assert_eq!(alias.host, "10.0.0.5");
        assert_eq!(alias.database.as_deref(), Some("orders"));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let cfg: GhostConfig = toml::from_str("").unwrap();
        assert!(cfg.aliases.is_empty());
        assert!(cfg.chunk_size.is_none());
    }
}
