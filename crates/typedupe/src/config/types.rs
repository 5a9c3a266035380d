//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::core::catalog::{StreamDefinition, DEFAULT_RAW_NAMESPACE};

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Destination warehouse.
    pub destination: DestinationConfig,

    /// Typing and deduplication behavior.
    #[serde(default)]
    pub typing: TypingConfig,

    /// Streams of the catalog.
    #[serde(default)]
    pub streams: Vec<StreamDefinition>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.typing = self.typing.with_auto_tuning(&resources);
        self
    }
}

/// Destination connection configuration.
///
/// `host`, `database` and `user` apply to server destinations; `path` to
/// SQLite.
#[derive(Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Destination type: postgres, mysql or sqlite.
    pub r#type: String,

    #[serde(default)]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Database file for SQLite; `:memory:` opens a private database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("path", &self.path)
            .finish()
    }
}

/// Typing and deduplication configuration.
/// Performance fields use Option<T> to distinguish between "not set"
/// (use auto-tuned default) and "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Concurrent typing passes. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// Maximum destination connections. Auto-tuned based on threads if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Namespace holding raw tables (default: "airbyte_internal").
    #[serde(default = "default_raw_namespace")]
    pub raw_namespace: String,

    /// Namespace for streams that declare none (default: "public").
    #[serde(default = "default_public_schema")]
    pub default_namespace: String,

    /// Only run raw table migrations (default: false).
    #[serde(default)]
    pub disable_type_dedupe: bool,

    /// Seconds a producer waits for a raw table insert lock (default: 30).
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            threads: None,
            max_connections: None,
            raw_namespace: default_raw_namespace(),
            default_namespace: default_public_schema(),
            disable_type_dedupe: false,
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl TypingConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Typing passes are destination-bound; one per core, capped at 8.
        let threads = *self
            .threads
            .get_or_insert_with(|| resources.cpu_cores.clamp(1, 8));

        // Each pass holds one connection; leave room for metadata queries.
        self.max_connections
            .get_or_insert_with(|| (threads * 2).clamp(2, 32));

        info!(
            "Auto-tuned config: threads={}, max_connections={}",
            self.get_threads(),
            self.get_max_connections()
        );
        self
    }

    // Accessors return the effective value with fallback defaults, for
    // configs that were not auto-tuned.

    pub fn get_threads(&self) -> usize {
        self.threads.unwrap_or(4)
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(8)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_raw_namespace() -> String {
    DEFAULT_RAW_NAMESPACE.to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_lock_timeout_secs() -> u64 {
    30
}
