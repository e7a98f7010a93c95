//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the service and its
//! task seeds.

mod error;
mod seed;
mod types;
mod yaml;

pub use error::ConfigError;
pub use seed::{load_seeds_from_directory, seed_tasks};
pub use types::{
    AuditRetentionConfig, BuiltinsConfig, CheckBackupsConfig, ExpireSessionsConfig,
    PruneCacheConfig, PruneLogsConfig, ServiceConfig, SiteConfig, StorageConfig, TaskSeed,
};
pub use yaml::YamlLoader;
