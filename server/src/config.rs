//! Configuration management for the server.

use dualsync_engine::{ConflictResolutionPolicy, SyncOptions, SyncSchema};
use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// JSON file holding the synced tables, in dependency order
    pub schema_path: PathBuf,
    /// Overrides the policy stored in the schema file
    pub conflict_policy: Option<ConflictResolutionPolicy>,
    pub use_bulk_operations: bool,
    pub disable_constraints: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let schema_path = lookup("SYNC_SCHEMA_PATH")
            .unwrap_or_else(|| "sync_schema.json".to_string())
            .into();

        let conflict_policy = lookup("CONFLICT_POLICY")
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("CONFLICT_POLICY", value))
            })
            .transpose()?;

        Ok(Self {
            host,
            port,
            database_url,
            schema_path,
            conflict_policy,
            use_bulk_operations: flag(&lookup, "USE_BULK_OPERATIONS", true)?,
            disable_constraints: flag(&lookup, "DISABLE_CONSTRAINTS", false)?,
        })
    }

    /// Read and validate the schema file.
    pub fn load_schema(&self) -> Result<SyncSchema, ConfigError> {
        let raw = std::fs::read_to_string(&self.schema_path)
            .map_err(|e| ConfigError::Schema(format!("{}: {}", self.schema_path.display(), e)))?;
        self.parse_schema(&raw)
    }

    fn parse_schema(&self, raw: &str) -> Result<SyncSchema, ConfigError> {
        let mut schema: SyncSchema =
            serde_json::from_str(raw).map_err(|e| ConfigError::Schema(e.to_string()))?;
        if let Some(policy) = self.conflict_policy {
            schema.conflict_resolution_policy = policy;
        }
        schema
            .validate()
            .map_err(|e| ConfigError::Schema(e.to_string()))?;
        Ok(schema)
    }

    /// Options for the rounds this server runs.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            use_bulk_operations: self.use_bulk_operations,
            disable_constraints_on_apply_changes: self.disable_constraints,
            ..SyncOptions::default()
        }
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key, value)),
        },
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value: {1}")]
    InvalidValue(&'static str, String),

    #[error("Invalid sync schema: {0}")]
    Schema(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/sync")]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.schema_path, PathBuf::from("sync_schema.json"));
        assert!(config.conflict_policy.is_none());
        assert!(config.use_bulk_operations);
        assert!(!config.disable_constraints);
    }

    #[test]
    fn test_database_url_required() {
        assert!(matches!(config(&[]), Err(ConfigError::MissingDatabaseUrl)));
    }

    #[test]
    fn test_invalid_values() {
        let url = ("DATABASE_URL", "postgres://localhost/sync");
        assert!(matches!(
            config(&[url, ("PORT", "http")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            config(&[url, ("CONFLICT_POLICY", "newest")]),
            Err(ConfigError::InvalidValue("CONFLICT_POLICY", _))
        ));
        assert!(matches!(
            config(&[url, ("USE_BULK_OPERATIONS", "maybe")]),
            Err(ConfigError::InvalidValue("USE_BULK_OPERATIONS", _))
        ));
    }

    #[test]
    fn test_policy_override_and_options() {
        let config = config(&[
            ("DATABASE_URL", "postgres://localhost/sync"),
            ("CONFLICT_POLICY", "ClientWins"),
            ("DISABLE_CONSTRAINTS", "yes"),
        ])
        .unwrap();

        let raw = r#"{"tables":[{"name":"Item","columns":[{"name":"id","columnType":"int","nullable":false}],"primaryKeys":["id"]}]}"#;
        let schema = config.parse_schema(raw).unwrap();
        assert_eq!(
            schema.conflict_resolution_policy,
            ConflictResolutionPolicy::ClientWins
        );

        let options = config.sync_options();
        assert!(options.disable_constraints_on_apply_changes);
        assert!(options.use_bulk_operations);
    }

    #[test]
    fn test_bad_schema_is_rejected() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/sync")]).unwrap();
        assert!(matches!(
            config.parse_schema("{\"tables\": 3}"),
            Err(ConfigError::Schema(_))
        ));
    }
}
