//! Configuration validation.

use std::collections::HashSet;

use super::Config;
use crate::core::catalog::DestinationSyncMode;
use crate::drivers::DialectImpl;
use crate::error::{Result, TypeDedupeError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let destination = &config.destination;

    // Destination validation
    let dialect = DialectImpl::from_db_type(&destination.r#type)?;
    match dialect {
        DialectImpl::Sqlite(_) => {
            if destination.path.is_none() {
                return Err(TypeDedupeError::Config(
                    "destination.path is required for sqlite".into(),
                ));
            }
        }
        DialectImpl::Postgres(_) | DialectImpl::Mysql(_) => {
            if destination.host.is_empty() {
                return Err(TypeDedupeError::Config("destination.host is required".into()));
            }
            if destination.database.is_empty() {
                return Err(TypeDedupeError::Config(
                    "destination.database is required".into(),
                ));
            }
            if destination.user.is_empty() {
                return Err(TypeDedupeError::Config("destination.user is required".into()));
            }
        }
    }

    // Typing config validation - only check if explicitly set
    if let Some(0) = config.typing.threads {
        return Err(TypeDedupeError::Config(
            "typing.threads must be at least 1".into(),
        ));
    }
    if let Some(0) = config.typing.max_connections {
        return Err(TypeDedupeError::Config(
            "typing.max_connections must be at least 1".into(),
        ));
    }
    if config.typing.raw_namespace.is_empty() {
        return Err(TypeDedupeError::Config(
            "typing.raw_namespace cannot be empty".into(),
        ));
    }

    // Stream validation
    let mut seen = HashSet::new();
    for stream in &config.streams {
        let label = match &stream.namespace {
            Some(ns) => format!("{}.{}", ns, stream.name),
            None => stream.name.clone(),
        };
        if stream.name.is_empty() {
            return Err(TypeDedupeError::Config("stream name cannot be empty".into()));
        }
        if !seen.insert((stream.namespace.clone(), stream.name.clone())) {
            return Err(TypeDedupeError::Config(format!(
                "stream {} is declared twice",
                label
            )));
        }
        if stream.sync_mode == DestinationSyncMode::AppendDedup && stream.primary_key.is_empty() {
            return Err(TypeDedupeError::Config(format!(
                "stream {} uses append_dedup but declares no primary_key",
                label
            )));
        }

        let properties = stream
            .json_schema
            .get("properties")
            .and_then(|p| p.as_object());
        let declared = |column: &str| properties.is_some_and(|p| p.contains_key(column));
        for column in &stream.primary_key {
            if !declared(column) {
                return Err(TypeDedupeError::Config(format!(
                    "stream {}: primary key column '{}' is not in json_schema.properties",
                    label, column
                )));
            }
        }
        if let Some(cursor) = &stream.cursor {
            if !declared(cursor) {
                return Err(TypeDedupeError::Config(format!(
                    "stream {}: cursor column '{}' is not in json_schema.properties",
                    label, cursor
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DestinationConfig, TypingConfig};
    use crate::core::catalog::StreamDefinition;
    use serde_json::json;

    fn valid_config() -> Config {
        Config {
            destination: DestinationConfig {
                r#type: "postgres".to_string(),
                host: "localhost".to_string(),
                port: 5432,
                database: "warehouse".to_string(),
                user: "loader".to_string(),
                password: "password".to_string(),
                ssl_mode: "disable".to_string(),
                path: None,
            },
            typing: TypingConfig::default(),
            streams: vec![StreamDefinition {
                namespace: Some("public".to_string()),
                name: "users".to_string(),
                sync_mode: DestinationSyncMode::AppendDedup,
                primary_key: vec!["id".to_string()],
                cursor: Some("updated_at".to_string()),
                json_schema: json!({
                    "type": "object",
                    "properties": {
                        "id": {"type": "integer"},
                        "updated_at": {"type": "string", "format": "date-time"}
                    }
                }),
            }],
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_destination_host() {
        let mut config = valid_config();
        config.destination.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_destination_type() {
        let mut config = valid_config();
        config.destination.r#type = "oracle".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("Supported types"));
    }

    #[test]
    fn test_sqlite_requires_path() {
        let mut config = valid_config();
        config.destination.r#type = "sqlite".to_string();
        assert!(validate(&config).is_err());
        config.destination.path = Some("warehouse.db".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut config = valid_config();
        config.typing.threads = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_dedup_without_primary_key_rejected() {
        let mut config = valid_config();
        config.streams[0].primary_key.clear();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("primary_key"));
    }

    #[test]
    fn test_undeclared_cursor_rejected() {
        let mut config = valid_config();
        config.streams[0].cursor = Some("missing".to_string());
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_duplicate_stream_rejected() {
        let mut config = valid_config();
        let dup = config.streams[0].clone();
        config.streams.push(dup);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_destination_config_debug_redacts_password() {
        let mut config = valid_config();
        config.destination.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config.destination);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_456"),
            "Debug output should not contain actual password value"
        );
    }
}
