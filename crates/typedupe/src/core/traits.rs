//! Core traits for dialects, destination handlers and state persistence.
//!
//! - [`Dialect`]: SQL syntax strategy for one destination engine
//! - [`DestinationHandler`]: executes SQL batches and inspects metadata
//! - [`StateHandler`]: persists the opaque per-stream state blob
//!
//! The generator composes a dialect with shared logic (ranking, error
//! column, soft reset); handlers are used as `Arc<dyn DestinationHandler<S>>`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::catalog::StreamConfig;
use super::identifier::{truncate_with_hash, ColumnNameResolver, StreamDescriptor, StreamId};
use super::schema::{DestinationInitialState, ExistingTable, RawTableWatermark};
use super::sql::Sql;
use super::types::PrimitiveType;
use crate::error::Result;
use crate::generator::SqlGenerator;
use crate::state::DestinationState;

/// Runtime shape of a JSON value, for struct/array extraction checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    Object,
    Array,
}

/// Rewrite of a text-encoded timestamp column into UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtcNormalization {
    /// Predicate selecting rows whose value carries a non-UTC offset.
    pub predicate: String,
    /// Expression producing the UTC value.
    pub expression: String,
}

/// Dialect trait for SQL syntax differences between destinations.
///
/// Implementations are stateless strategy objects. `data` arguments are SQL
/// expressions evaluating to the raw JSON payload; `key` is the original
/// (unquoted) property name.
pub trait Dialect: Send + Sync {
    /// Dialect name for logging and errors.
    fn name(&self) -> &str;

    /// Quote an identifier.
    fn quote_ident(&self, name: &str) -> String;

    /// Quote a namespace-qualified table name.
    fn qualify(&self, namespace: &str, name: &str) -> String {
        format!("{}.{}", self.quote_ident(namespace), self.quote_ident(name))
    }

    /// Quote a string literal.
    fn string_literal(&self, value: &str) -> String {
        super::identifier::quote_literal(value)
    }

    fn max_identifier_length(&self) -> usize;

    fn case_insensitive_identifiers(&self) -> bool;

    /// Resolve the raw and final table names of a stream.
    ///
    /// The default layout puts final tables in the stream's namespace and raw
    /// tables in `raw_namespace` as `{namespace}_raw__stream_{name}`.
    fn build_stream_id(
        &self,
        namespace: Option<&str>,
        name: &str,
        default_namespace: &str,
        raw_namespace: &str,
    ) -> StreamId {
        let max = self.max_identifier_length();
        let ns = namespace.unwrap_or(default_namespace);
        StreamId {
            final_namespace: truncate_with_hash(ns, max),
            final_name: truncate_with_hash(name, max),
            raw_namespace: truncate_with_hash(raw_namespace, max),
            raw_name: truncate_with_hash(&format!("{}_raw__stream_{}", ns, name), max),
            original_namespace: namespace.map(str::to_string),
            original_name: name.to_string(),
        }
    }

    /// Column resolver honoring this dialect's length and case rules.
    fn column_resolver(&self, reserved: &[&str]) -> ColumnNameResolver {
        ColumnNameResolver::new(
            self.max_identifier_length(),
            self.case_insensitive_identifiers(),
            reserved,
        )
    }

    /// Whether `CREATE SCHEMA` can be expressed.
    fn supports_create_schema(&self) -> bool;

    /// Whether final-table column shapes can be introspected and compared.
    fn supports_schema_introspection(&self) -> bool;

    /// Whether plain casts raise on bad input, making a fast path worthwhile.
    fn supports_fast_casting(&self) -> bool;

    /// Native column type for a materialized logical type.
    fn primitive_type(&self, ty: PrimitiveType) -> &'static str;

    /// Native semi-structured type (or its text stand-in).
    fn json_type(&self) -> &'static str;

    fn timestamp_type(&self) -> &'static str;

    fn raw_id_type(&self) -> &'static str;

    /// Extract a property as a JSON value.
    fn extract_json(&self, data: &str, key: &str) -> String;

    /// Predicate: the property is present and has the given JSON shape.
    fn json_has_shape(&self, data: &str, key: &str, shape: JsonShape) -> String;

    /// Predicate: the property is present and not JSON `null`.
    fn json_is_present(&self, data: &str, key: &str) -> String;

    /// Extract a property and cast it to a primitive type.
    ///
    /// With `safe`, values that fail to parse yield NULL instead of raising.
    fn cast_primitive(&self, data: &str, key: &str, ty: PrimitiveType, safe: bool) -> String;

    /// Build the `_airbyte_meta` value from `(condition, message)` pairs.
    ///
    /// Each message whose condition holds is collected into
    /// `{"errors": [...]}`.
    fn build_meta(&self, errors: &[(String, String)]) -> String;

    fn current_timestamp(&self) -> String;

    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String;

    /// Sort key for "descending, NULLs last".
    fn order_desc_nulls_last(&self, expr: &str) -> String {
        format!("{} DESC NULLS LAST", expr)
    }

    /// Rename a table within its namespace.
    fn rename_table(&self, namespace: &str, from: &str, to: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.qualify(namespace, from),
            self.quote_ident(to)
        )
    }

    /// Rewrite for timestamp columns stored as offset-bearing text.
    ///
    /// `None` when the destination stores native timezone-aware values.
    fn utc_normalization(&self, _column: &str) -> Option<UtcNormalization> {
        None
    }
}

/// Executes generated SQL and reports destination metadata.
///
/// No internal retry is attempted: a failed batch surfaces as an error and
/// the caller decides what to do.
#[async_trait]
pub trait DestinationHandler<S: DestinationState>: StateHandler<S> {
    /// Run every group of the batch; multi-statement groups run in one
    /// transaction.
    async fn execute(&self, sql: &Sql) -> Result<()>;

    /// Generator for this destination's dialect.
    fn generator(&self) -> &SqlGenerator;

    /// Column shape of a table, or `None` when it does not exist.
    async fn describe_table(&self, namespace: &str, name: &str) -> Result<Option<ExistingTable>>;

    /// Run a query returning a single integer.
    async fn query_count(&self, sql: &str) -> Result<i64>;

    /// Extraction-time watermarks of a stream's raw table.
    async fn raw_table_watermark(&self, id: &StreamId) -> Result<RawTableWatermark>;

    /// Existence, emptiness, schema match, watermark and state per stream.
    ///
    /// Streams never synced before map to "final table does not exist". A
    /// dialect that cannot introspect reports a mismatch.
    async fn gather_initial_state(
        &self,
        streams: &[StreamConfig],
    ) -> Result<Vec<DestinationInitialState<S>>> {
        let mut states = self.get_states().await?;
        let mut initial = Vec::with_capacity(streams.len());

        for stream in streams {
            let id = &stream.id;
            let existing = self.describe_table(&id.final_namespace, &id.final_name).await?;
            let (is_final_table_present, is_final_table_empty, is_schema_mismatch) = match existing {
                None => (false, true, false),
                Some(table) => {
                    let rows = self
                        .query_count(&self.generator().final_table_row_probe(id))
                        .await?;
                    let mismatch = match self.generator().existing_schema_matches(stream, &table) {
                        Ok(matches) => !matches,
                        Err(e) if e.is_unsupported() => true,
                        Err(e) => return Err(e),
                    };
                    (true, rows == 0, mismatch)
                }
            };
            let raw_table = self.raw_table_watermark(id).await?;

            debug!(
                "Initial state of {}: present={}, empty={}, mismatch={}, unprocessed={}",
                id,
                is_final_table_present,
                is_final_table_empty,
                is_schema_mismatch,
                raw_table.has_unprocessed_records()
            );

            initial.push(DestinationInitialState {
                stream: stream.clone(),
                is_final_table_present,
                is_final_table_empty,
                is_schema_mismatch,
                raw_table,
                destination_state: states.remove(&id.descriptor()).unwrap_or_default(),
            });
        }

        Ok(initial)
    }

    /// Persist each stream's state blob; each stream's write is atomic.
    async fn commit_destination_states(&self, states: &HashMap<StreamId, S>) -> Result<()> {
        self.commit_states(states).await
    }

    /// Destination type name for logging/debugging.
    fn destination_type(&self) -> &'static str;
}

/// Durable per-stream storage for the opaque state blob.
#[async_trait]
pub trait StateHandler<S: DestinationState>: Send + Sync {
    /// Ensure the state table exists and load every stored blob.
    ///
    /// Streams without an entry have no prior state.
    async fn get_states(&self) -> Result<HashMap<StreamDescriptor, S>>;

    /// Replace the stored blob of every included stream.
    async fn commit_states(&self, states: &HashMap<StreamId, S>) -> Result<()>;
}
