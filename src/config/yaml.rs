//! YAML configuration parsing.
//!
//! Parses the service configuration and validates it before anything touches
//! the store.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{ServiceConfig, StorageConfig};

/// Loader for YAML configuration files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load service configuration from a file.
    pub fn load_service_config(path: impl AsRef<Path>) -> Result<ServiceConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServiceConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_service_config(&config)?;
        Ok(config)
    }

    /// Parse service configuration from a YAML string.
    pub fn parse_service_config(yaml: &str) -> Result<ServiceConfig, ConfigError> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)?;
        Self::validate_service_config(&config)?;
        Ok(config)
    }

    /// Validate a service configuration.
    pub fn validate_service_config(config: &ServiceConfig) -> Result<(), ConfigError> {
        if config.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "unknown log level: {}",
                config.log_level
            )));
        }

        if config.sleep_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "sleep_interval_secs must be at least 1".into(),
            ));
        }

        if config.pid_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("pid_file".into()));
        }

        Self::validate_storage(&config.database)?;
        for (site, site_config) in &config.sites {
            if site.trim().is_empty() {
                return Err(ConfigError::InvalidConfig("empty site name".into()));
            }
            if let Some(database) = &site_config.database {
                Self::validate_storage(database)?;
            }
        }

        let mut names = HashSet::new();
        for task in &config.tasks {
            if task.name.trim().is_empty() {
                return Err(ConfigError::MissingField("tasks[].name".into()));
            }
            if task.handler().trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}' has an empty handler",
                    task.name
                )));
            }
            if !names.insert(task.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }
        }

        if let Some(sessions) = &config.builtins.expire_sessions {
            Self::validate_identifiers("expire_sessions", [&sessions.table, &sessions.column])?;
        }
        if let Some(audit) = &config.builtins.audit_retention {
            Self::validate_identifiers("audit_retention", [&audit.table, &audit.column])?;
        }

        Ok(())
    }

    fn validate_identifiers(section: &str, idents: [&String; 2]) -> Result<(), ConfigError> {
        for ident in idents {
            if !is_identifier(ident) {
                return Err(ConfigError::InvalidConfig(format!(
                    "{}: '{}' is not a plain SQL identifier",
                    section, ident
                )));
            }
        }
        Ok(())
    }

    fn validate_storage(storage: &StorageConfig) -> Result<(), ConfigError> {
        match storage {
            StorageConfig::Sqlite { path } if path.trim().is_empty() => {
                Err(ConfigError::MissingField("database.path".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Letters, digits and underscores, not starting with a digit.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
