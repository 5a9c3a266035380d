//! Error types for the typing and deduplication library.

use std::time::Duration;

use thiserror::Error;

/// Main error type for typing/deduplication operations.
///
/// Cast failures are deliberately absent: a value that cannot be converted to
/// its declared type is recorded in the row's `_airbyte_meta` column and never
/// surfaces as an error.
#[derive(Error, Debug)]
pub enum TypeDedupeError {
    /// Configuration error (invalid YAML, missing fields, bad catalog, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The dialect cannot express the requested operation.
    #[error("{dialect} does not support {operation}")]
    UnsupportedCapability {
        dialect: String,
        operation: String,
    },

    /// Identifier failed validation
    #[error("Invalid identifier: {0}")]
    Identifier(String),

    /// The destination rejected or failed to run a SQL batch
    #[error("Destination error: {message}\n  Context: {context}")]
    Destination { message: String, context: String },

    /// PostgreSQL driver error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// SQLite driver error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A migration's confirm-and-mutate step failed
    #[error("Migration {migration} failed for stream {stream}: {message}")]
    Migration {
        stream: String,
        migration: String,
        message: String,
    },

    /// Raw table insert lock could not be acquired in time
    #[error("Timed out after {waited:?} waiting for the raw table insert lock on {stream}")]
    LockTimeout { stream: String, waited: Duration },

    /// Stream is not part of the parsed catalog
    #[error("Stream not found in catalog: {0}")]
    StreamNotFound(String),

    /// Typing and deduplication failed for a specific stream
    #[error("Typing and deduplication failed for stream {stream}: {message}")]
    TypingFailed { stream: String, message: String },

    /// A spawned worker task panicked
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sync was cancelled (SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

impl TypeDedupeError {
    /// Create an UnsupportedCapability error
    pub fn unsupported(dialect: impl Into<String>, operation: impl Into<String>) -> Self {
        TypeDedupeError::UnsupportedCapability {
            dialect: dialect.into(),
            operation: operation.into(),
        }
    }

    /// Create a Destination error with context about where it occurred
    pub fn destination(message: impl Into<String>, context: impl Into<String>) -> Self {
        TypeDedupeError::Destination {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        TypeDedupeError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Migration error
    pub fn migration(
        stream: impl Into<String>,
        migration: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TypeDedupeError::Migration {
            stream: stream.into(),
            migration: migration.into(),
            message: message.into(),
        }
    }

    /// Create a TypingFailed error
    pub fn typing(stream: impl Into<String>, message: impl Into<String>) -> Self {
        TypeDedupeError::TypingFailed {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// True for the error raised when a dialect lacks a capability.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, TypeDedupeError::UnsupportedCapability { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            TypeDedupeError::Config(_)
            | TypeDedupeError::Identifier(_)
            | TypeDedupeError::Yaml(_)
            | TypeDedupeError::StreamNotFound(_) => 1,
            TypeDedupeError::UnsupportedCapability { .. } => 2,
            TypeDedupeError::Destination { .. } | TypeDedupeError::Pool { .. } => 3,
            #[cfg(feature = "postgres")]
            TypeDedupeError::Postgres(_) => 3,
            #[cfg(feature = "sqlite")]
            TypeDedupeError::Sqlite(_) => 3,
            TypeDedupeError::Migration { .. } => 4,
            TypeDedupeError::TypingFailed { .. } | TypeDedupeError::TaskPanicked(_) => 5,
            TypeDedupeError::LockTimeout { .. } => 6,
            TypeDedupeError::Io(_) | TypeDedupeError::Json(_) => 7,
            TypeDedupeError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for typing/deduplication operations.
pub type Result<T> = std::result::Result<T, TypeDedupeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_message_names_dialect_and_operation() {
        let err = TypeDedupeError::unsupported("sqlite", "CREATE SCHEMA");
        assert!(err.is_unsupported());
        assert_eq!(err.to_string(), "sqlite does not support CREATE SCHEMA");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TypeDedupeError::Config("x".into()).exit_code(), 1);
        assert_eq!(TypeDedupeError::destination("boom", "execute").exit_code(), 3);
        assert_eq!(TypeDedupeError::migration("s", "m", "x").exit_code(), 4);
        assert_eq!(TypeDedupeError::Cancelled.exit_code(), 130);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(TypeDedupeError::from(io).exit_code(), 7);
    }

    #[test]
    fn test_format_detailed_walks_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.yaml");
        let err = TypeDedupeError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: config.yaml"));
    }
}
