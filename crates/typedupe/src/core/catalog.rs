//! Stream configuration and catalog parsing.
//!
//! The catalog arrives as a list of [`StreamDefinition`]s (namespace, name,
//! JSON schema, primary key, cursor, sync mode). [`CatalogParser`] resolves
//! every stream and column name through the destination dialect once, before
//! any SQL is generated; the resulting [`StreamConfig`]s are read-only.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::identifier::{ColumnId, StreamDescriptor, StreamId};
use super::schema::{COLUMN_CDC_DELETED_AT, FINAL_TABLE_META_COLUMNS};
use super::traits::Dialect;
use super::types::LogicalType;
use crate::drivers::DialectImpl;
use crate::error::{Result, TypeDedupeError};

/// Default namespace holding raw tables.
pub const DEFAULT_RAW_NAMESPACE: &str = "airbyte_internal";

/// How records of a stream land in the final table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationSyncMode {
    /// Append every record.
    #[default]
    Append,

    /// Append, keeping one row per primary key.
    AppendDedup,

    /// Replace the final table; deduplicated when a primary key is declared.
    Overwrite,
}

/// One stream as described by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,

    #[serde(default)]
    pub sync_mode: DestinationSyncMode,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    /// JSON schema of a record; top-level properties become columns.
    pub json_schema: Value,
}

/// Resolved configuration of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub id: StreamId,
    pub sync_mode: DestinationSyncMode,
    pub primary_key: Vec<ColumnId>,
    pub cursor: Option<ColumnId>,
    /// Declared columns in schema order.
    pub columns: Vec<(ColumnId, LogicalType)>,
}

impl StreamConfig {
    /// True when typing keeps only the latest row per primary key.
    pub fn is_dedup(&self) -> bool {
        match self.sync_mode {
            DestinationSyncMode::Append => false,
            DestinationSyncMode::AppendDedup | DestinationSyncMode::Overwrite => {
                !self.primary_key.is_empty()
            }
        }
    }

    pub fn column(&self, original_name: &str) -> Option<&ColumnId> {
        self.columns
            .iter()
            .map(|(id, _)| id)
            .find(|id| id.original_name == original_name)
    }

    pub fn cdc_deleted_at(&self) -> Option<&ColumnId> {
        self.column(COLUMN_CDC_DELETED_AT)
    }
}

/// All streams of a sync, in catalog order.
#[derive(Debug, Clone, Default)]
pub struct ParsedCatalog {
    pub streams: Vec<StreamConfig>,
}

impl ParsedCatalog {
    pub fn new(streams: Vec<StreamConfig>) -> Self {
        Self { streams }
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Result<&StreamConfig> {
        let wanted = StreamDescriptor::new(namespace, name);
        self.streams
            .iter()
            .find(|s| s.id.descriptor() == wanted)
            .ok_or_else(|| TypeDedupeError::StreamNotFound(wanted.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.iter()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Resolves stream definitions into stream configurations for one dialect.
#[derive(Debug, Clone)]
pub struct CatalogParser {
    dialect: DialectImpl,
    raw_namespace: String,
    default_namespace: String,
}

impl CatalogParser {
    pub fn new(
        dialect: DialectImpl,
        raw_namespace: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            dialect,
            raw_namespace: raw_namespace.into(),
            default_namespace: default_namespace.into(),
        }
    }

    pub fn parse(&self, definitions: &[StreamDefinition]) -> Result<ParsedCatalog> {
        let mut streams = Vec::with_capacity(definitions.len());
        let mut final_tables = HashSet::new();

        for def in definitions {
            let mut config = self.parse_stream(def)?;

            // Two streams resolving to one final table get a numeric suffix.
            let mut counter = 0usize;
            let base = config.id.clone();
            while !final_tables.insert((
                config.id.final_namespace.to_lowercase(),
                config.id.final_name.to_lowercase(),
            )) {
                counter += 1;
                config.id.final_name = format!("{}_{}", base.final_name, counter);
                config.id.raw_name = format!("{}_{}", base.raw_name, counter);
            }
            if counter > 0 {
                warn!(
                    "Stream {} collides with another stream's final table, using {}",
                    config.id, config.id.final_name
                );
            }

            streams.push(config);
        }

        Ok(ParsedCatalog::new(streams))
    }

    /// Resolve a single stream definition.
    pub fn parse_stream(&self, def: &StreamDefinition) -> Result<StreamConfig> {
        if def.name.is_empty() {
            return Err(TypeDedupeError::Config("stream name cannot be empty".into()));
        }

        let id = self.dialect.build_stream_id(
            def.namespace.as_deref(),
            &def.name,
            &self.default_namespace,
            &self.raw_namespace,
        );

        let mut resolver = self.dialect.column_resolver(&FINAL_TABLE_META_COLUMNS);
        let columns: Vec<(ColumnId, LogicalType)> = def
            .json_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, schema)| {
                        (resolver.resolve(name), LogicalType::from_json_schema(schema))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let lookup = |field: &str, role: &str| -> Result<ColumnId> {
            columns
                .iter()
                .find(|(c, _)| c.original_name == field)
                .map(|(c, _)| c.clone())
                .ok_or_else(|| {
                    TypeDedupeError::Config(format!(
                        "{} field '{}' of stream {} is not declared in its schema",
                        role, field, id
                    ))
                })
        };

        let primary_key = def
            .primary_key
            .iter()
            .map(|pk| lookup(pk, "primary key"))
            .collect::<Result<Vec<_>>>()?;
        let cursor = def
            .cursor
            .as_deref()
            .map(|c| lookup(c, "cursor"))
            .transpose()?;

        if def.sync_mode == DestinationSyncMode::AppendDedup && primary_key.is_empty() {
            return Err(TypeDedupeError::Config(format!(
                "stream {} uses append_dedup but declares no primary key",
                id
            )));
        }

        debug!(
            "Parsed stream {} -> final {}.{}, raw {}.{} ({} columns)",
            id,
            id.final_namespace,
            id.final_name,
            id.raw_namespace,
            id.raw_name,
            columns.len()
        );

        Ok(StreamConfig {
            id,
            sync_mode: def.sync_mode,
            primary_key,
            cursor,
            columns,
        })
    }
}
