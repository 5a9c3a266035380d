//! Raw-to-final SQL generation.
//!
//! [`SqlGenerator`] composes a [`DialectImpl`] with the logic every
//! destination shares: per-column extraction and casting, the
//! `_airbyte_meta` error column, row-number deduplication, CDC deletes,
//! soft-reset tables and the overwrite swap. It never performs I/O; every
//! operation returns a [`Sql`] batch for a destination handler to execute.
//!
//! The typing insert nests derived tables instead of CTEs so the same shape
//! runs on every supported engine:
//!
//! ```text
//! INSERT INTO final (...)
//! SELECT ... FROM (                      -- "numbered": meta + ROW_NUMBER
//!   SELECT ... FROM (                    -- "typed": one cast per column
//!     SELECT ... FROM raw WHERE _airbyte_loaded_at IS NULL
//!   ) AS "typed"
//! ) AS "numbered"
//! WHERE "_airbyte_row_number" = 1        -- dedup modes only
//! ```

use chrono::{DateTime, Utc};

use crate::core::catalog::StreamConfig;
use crate::core::identifier::{validate_identifier, ColumnId, StreamId};
use crate::core::schema::{
    ExistingTable, COLUMN_DATA, COLUMN_EXTRACTED_AT, COLUMN_LOADED_AT, COLUMN_META,
    COLUMN_RAW_ID, FINAL_TABLE_META_COLUMNS,
};
use crate::core::sql::Sql;
use crate::core::traits::{Dialect, JsonShape};
use crate::core::types::{LogicalType, PrimitiveType};
use crate::drivers::DialectImpl;
use crate::error::{Result, TypeDedupeError};

/// Suffix of the table a soft reset rebuilds into.
pub const SOFT_RESET_SUFFIX: &str = "_ab_soft_reset";

/// Suffix of the table an overwrite sync builds into.
pub const TMP_OVERWRITE_SUFFIX: &str = "_airbyte_tmp";

const TYPED_ALIAS: &str = "typed";
const NUMBERED_ALIAS: &str = "numbered";
const ROW_NUMBER_COLUMN: &str = "_airbyte_row_number";

/// Dialect-aware generator of typing and deduplication SQL.
#[derive(Debug, Clone)]
pub struct SqlGenerator {
    dialect: DialectImpl,
}

impl SqlGenerator {
    pub fn new(dialect: DialectImpl) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    /// Resolve the raw and final table names of a stream.
    pub fn build_stream_id(&self, namespace: &str, name: &str, raw_namespace: &str) -> StreamId {
        self.dialect
            .build_stream_id(Some(namespace), name, namespace, raw_namespace)
    }

    /// Resolve a single column name against the metadata columns.
    pub fn build_column_id(&self, name: &str) -> ColumnId {
        self.dialect
            .column_resolver(&FINAL_TABLE_META_COLUMNS)
            .resolve(name)
    }

    pub fn create_schema(&self, schema: &str) -> Result<Sql> {
        if !self.dialect.supports_create_schema() {
            return Err(self.unsupported("CREATE SCHEMA"));
        }
        validate_identifier(schema)?;
        Ok(Sql::of(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.dialect.quote_ident(schema)
        )))
    }

    /// Native column type of a logical type.
    pub fn column_type(&self, ty: &LogicalType) -> &'static str {
        match ty.choose_type() {
            LogicalType::Primitive(p) => self.dialect.primitive_type(*p),
            _ => self.dialect.json_type(),
        }
    }

    /// Expected `(name, type)` shape of the final table, metadata first.
    pub fn expected_columns(&self, stream: &StreamConfig) -> Vec<(String, String)> {
        let d = &self.dialect;
        let mut columns = vec![
            (COLUMN_RAW_ID.to_string(), d.raw_id_type().to_string()),
            (COLUMN_EXTRACTED_AT.to_string(), d.timestamp_type().to_string()),
            (COLUMN_LOADED_AT.to_string(), d.timestamp_type().to_string()),
            (COLUMN_META.to_string(), d.json_type().to_string()),
        ];
        columns.extend(
            stream
                .columns
                .iter()
                .map(|(id, ty)| (id.name.clone(), self.column_type(ty).to_string())),
        );
        columns
    }

    /// Final table DDL. With `force`, an existing table of the same name is
    /// dropped in the same transaction.
    pub fn create_table(&self, stream: &StreamConfig, suffix: &str, force: bool) -> Result<Sql> {
        let name = self.suffixed_name(&stream.id, suffix);
        validate_identifier(&name)?;
        let table = self.dialect.qualify(&stream.id.final_namespace, &name);

        let mut defs: Vec<String> = Vec::with_capacity(stream.columns.len() + 4);
        for (column, ty) in self.expected_columns(stream) {
            let not_null = matches!(
                column.as_str(),
                COLUMN_RAW_ID | COLUMN_EXTRACTED_AT | COLUMN_META
            );
            defs.push(format!(
                "{} {}{}",
                self.dialect.quote_ident(&column),
                ty,
                if not_null { " NOT NULL" } else { "" }
            ));
        }

        let create = format!("CREATE TABLE {} (\n  {}\n)", table, defs.join(",\n  "));
        if force {
            Ok(Sql::transactionally([
                format!("DROP TABLE IF EXISTS {}", table),
                create,
            ]))
        } else {
            Ok(Sql::of(create))
        }
    }

    /// Raw table DDL; a no-op when the table already exists.
    pub fn create_raw_table(&self, id: &StreamId) -> Result<Sql> {
        validate_identifier(&id.raw_name)?;
        let d = &self.dialect;
        Ok(Sql::of(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {} {} NOT NULL,\n  {} {} NOT NULL,\n  {} {} NOT NULL,\n  {} {},\n  {} {}\n)",
            self.raw_table(id),
            d.quote_ident(COLUMN_RAW_ID),
            d.raw_id_type(),
            d.quote_ident(COLUMN_DATA),
            d.json_type(),
            d.quote_ident(COLUMN_EXTRACTED_AT),
            d.timestamp_type(),
            d.quote_ident(COLUMN_LOADED_AT),
            d.timestamp_type(),
            d.quote_ident(COLUMN_META),
            d.json_type(),
        )))
    }

    /// Compare an introspected final table against the expected shape.
    ///
    /// Column order is irrelevant; names compare case-insensitively on
    /// case-insensitive dialects and types always compare case-insensitively.
    pub fn existing_schema_matches(
        &self,
        stream: &StreamConfig,
        existing: &ExistingTable,
    ) -> Result<bool> {
        if !self.dialect.supports_schema_introspection() {
            return Err(self.unsupported("final table introspection"));
        }

        let expected = self.expected_columns(stream);
        if expected.len() != existing.columns.len() {
            return Ok(false);
        }

        let ci = self.dialect.case_insensitive_identifiers();
        Ok(expected.iter().all(|(name, ty)| {
            existing.columns.iter().any(|c| {
                let same_name = if ci {
                    c.name.eq_ignore_ascii_case(name)
                } else {
                    c.name == *name
                };
                same_name && c.data_type.eq_ignore_ascii_case(ty)
            })
        }))
    }

    /// DDL bringing the final table in line with the stream.
    ///
    /// Absent tables are created; matching tables need nothing; anything else
    /// is rebuilt into the soft-reset table, swapped in at commit.
    pub fn prepare_final_table(
        &self,
        stream: &StreamConfig,
        existing: Option<&ExistingTable>,
    ) -> Result<Sql> {
        let Some(existing) = existing else {
            return self.create_table(stream, "", false);
        };
        match self.existing_schema_matches(stream, existing) {
            Ok(true) => Ok(Sql::empty()),
            Ok(false) => self.prepare_tables_for_soft_reset(stream),
            Err(e) if e.is_unsupported() => self.prepare_tables_for_soft_reset(stream),
            Err(e) => Err(e),
        }
    }

    pub fn prepare_tables_for_soft_reset(&self, stream: &StreamConfig) -> Result<Sql> {
        Ok(Sql::concat([
            self.create_table(stream, SOFT_RESET_SUFFIX, true)?,
            self.clear_loaded_at(&stream.id),
        ]))
    }

    /// Mark every raw row as not yet typed.
    pub fn clear_loaded_at(&self, id: &StreamId) -> Sql {
        Sql::of(format!(
            "UPDATE {} SET {} = NULL",
            self.raw_table(id),
            self.dialect.quote_ident(COLUMN_LOADED_AT)
        ))
    }

    /// Type and deduplicate unprocessed raw rows into the final table
    /// (`final_suffix` selects a soft-reset or overwrite table).
    ///
    /// One transaction: insert typed rows, delete superseded rows, delete CDC
    /// tombstones, then mark the consumed raw rows as loaded. On dialects
    /// whose plain casts never raise, casting is always safe.
    pub fn update_table(
        &self,
        stream: &StreamConfig,
        final_suffix: &str,
        min_raw_timestamp: Option<DateTime<Utc>>,
        use_safe_casting: bool,
    ) -> Result<Sql> {
        let safe = use_safe_casting || !self.dialect.supports_fast_casting();
        let final_name = self.suffixed_name(&stream.id, final_suffix);
        validate_identifier(&final_name)?;
        let final_table = self.dialect.qualify(&stream.id.final_namespace, &final_name);

        let mut statements = vec![self.insert_new_records(stream, &final_table, min_raw_timestamp, safe)];
        if stream.is_dedup() {
            statements.push(self.dedup_final_table(stream, &final_table));
            if let Some(cdc) = stream.cdc_deleted_at() {
                statements.push(format!(
                    "DELETE FROM {} WHERE {} IS NOT NULL",
                    final_table,
                    self.dialect.quote_ident(&cdc.name)
                ));
            }
        }
        statements.push(self.commit_raw_table(&stream.id, min_raw_timestamp));

        Ok(Sql::transactionally(statements))
    }

    /// Drop the final table and rename the suffixed table into its place.
    pub fn overwrite_final_table(&self, id: &StreamId, suffix: &str) -> Result<Sql> {
        if suffix.is_empty() {
            return Ok(Sql::empty());
        }
        let source = self.suffixed_name(id, suffix);
        validate_identifier(&source)?;
        Ok(Sql::transactionally([
            format!(
                "DROP TABLE IF EXISTS {}",
                self.dialect.qualify(&id.final_namespace, &id.final_name)
            ),
            self.dialect
                .rename_table(&id.final_namespace, &source, &id.final_name),
        ]))
    }

    pub fn migrate_raw_add_meta_column(&self, id: &StreamId) -> Sql {
        Sql::of(format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.raw_table(id),
            self.dialect.quote_ident(COLUMN_META),
            self.dialect.json_type()
        ))
    }

    /// Rewrite offset-bearing `_airbyte_extracted_at` values into UTC.
    pub fn normalize_extracted_at_to_utc(&self, id: &StreamId) -> Result<Sql> {
        let column = self.dialect.quote_ident(COLUMN_EXTRACTED_AT);
        let rewrite = self
            .dialect
            .utc_normalization(&column)
            .ok_or_else(|| self.unsupported("extracted_at UTC normalization"))?;
        Ok(Sql::of(format!(
            "UPDATE {} SET {} = {} WHERE {}",
            self.raw_table(id),
            column,
            rewrite.expression,
            rewrite.predicate
        )))
    }

    /// Count of raw rows whose `_airbyte_extracted_at` is not in UTC.
    pub fn count_non_utc_extracted_at(&self, id: &StreamId) -> Result<String> {
        let column = self.dialect.quote_ident(COLUMN_EXTRACTED_AT);
        let rewrite = self
            .dialect
            .utc_normalization(&column)
            .ok_or_else(|| self.unsupported("extracted_at UTC normalization"))?;
        Ok(format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.raw_table(id),
            rewrite.predicate
        ))
    }

    /// Query returning 0 when the final table has no rows, 1 otherwise.
    pub fn final_table_row_probe(&self, id: &StreamId) -> String {
        format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} LIMIT 1) AS {}",
            self.dialect.qualify(&id.final_namespace, &id.final_name),
            self.dialect.quote_ident("probe")
        )
    }

    /// Query returning the earliest and latest unprocessed extraction
    /// timestamps and the latest processed one, as three columns.
    pub fn raw_watermark_query(&self, id: &StreamId) -> String {
        let loaded = self.dialect.quote_ident(COLUMN_LOADED_AT);
        let extracted = self.dialect.quote_ident(COLUMN_EXTRACTED_AT);
        format!(
            "SELECT\n  MIN(CASE WHEN {l} IS NULL THEN {e} END),\n  MAX(CASE WHEN {l} IS NULL THEN {e} END),\n  MAX(CASE WHEN {l} IS NOT NULL THEN {e} END)\nFROM {raw}",
            l = loaded,
            e = extracted,
            raw = self.raw_table(id)
        )
    }

    pub fn raw_table(&self, id: &StreamId) -> String {
        self.dialect.qualify(&id.raw_namespace, &id.raw_name)
    }

    pub fn final_table(&self, id: &StreamId, suffix: &str) -> String {
        self.dialect
            .qualify(&id.final_namespace, &self.suffixed_name(id, suffix))
    }

    fn suffixed_name(&self, id: &StreamId, suffix: &str) -> String {
        id.final_name_with_suffix(suffix, self.dialect.max_identifier_length())
    }

    fn unsupported(&self, operation: &str) -> TypeDedupeError {
        TypeDedupeError::unsupported(self.dialect.name(), operation)
    }

    fn extract_column(&self, data: &str, key: &str, ty: &LogicalType, safe: bool) -> String {
        let d = &self.dialect;
        match ty.choose_type() {
            LogicalType::Struct(_) => format!(
                "CASE WHEN {} THEN {} ELSE NULL END",
                d.json_has_shape(data, key, JsonShape::Object),
                d.extract_json(data, key)
            ),
            LogicalType::Array(_) => format!(
                "CASE WHEN {} THEN {} ELSE NULL END",
                d.json_has_shape(data, key, JsonShape::Array),
                d.extract_json(data, key)
            ),
            LogicalType::Primitive(p) => d.cast_primitive(data, key, *p, safe),
            LogicalType::Union(_) => d.cast_primitive(data, key, PrimitiveType::Unknown, safe),
        }
    }

    fn typed(&self, column: &str) -> String {
        format!(
            "{}.{}",
            self.dialect.quote_ident(TYPED_ALIAS),
            self.dialect.quote_ident(column)
        )
    }

    /// `ROW_NUMBER()` ranking the latest row per primary key first.
    fn row_number(&self, stream: &StreamConfig, qualify: impl Fn(&str) -> String) -> String {
        let partition: Vec<String> = stream.primary_key.iter().map(|pk| qualify(&pk.name)).collect();
        let mut order = Vec::with_capacity(2);
        if let Some(cursor) = &stream.cursor {
            order.push(self.dialect.order_desc_nulls_last(&qualify(&cursor.name)));
        }
        order.push(format!("{} DESC", qualify(COLUMN_EXTRACTED_AT)));
        format!(
            "ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {})",
            partition.join(", "),
            order.join(", ")
        )
    }

    fn insert_new_records(
        &self,
        stream: &StreamConfig,
        final_table: &str,
        min_raw_timestamp: Option<DateTime<Utc>>,
        safe: bool,
    ) -> String {
        let d = &self.dialect;
        let q = |c: &str| d.quote_ident(c);
        let user_columns: Vec<String> = stream.columns.iter().map(|(id, _)| q(&id.name)).collect();
        let raw_data = q(COLUMN_DATA);
        let typed_data = self.typed(COLUMN_DATA);

        // Innermost level: one cast per declared column.
        let mut casts: Vec<String> = stream
            .columns
            .iter()
            .map(|(id, ty)| {
                format!(
                    "{} AS {}",
                    self.extract_column(&raw_data, &id.original_name, ty, safe),
                    q(&id.name)
                )
            })
            .collect();
        casts.extend([q(COLUMN_RAW_ID), q(COLUMN_EXTRACTED_AT), raw_data.clone()]);

        let mut raw_filter = format!("{} IS NULL", q(COLUMN_LOADED_AT));
        if let Some(ts) = min_raw_timestamp {
            raw_filter.push_str(&format!(
                " AND {} > {}",
                q(COLUMN_EXTRACTED_AT),
                d.timestamp_literal(&ts)
            ));
        }

        // Middle level: error column and dedup ranking.
        let errors: Vec<(String, String)> = stream
            .columns
            .iter()
            .map(|(id, _)| {
                (
                    format!(
                        "{} IS NULL AND {}",
                        self.typed(&id.name),
                        d.json_is_present(&typed_data, &id.original_name)
                    ),
                    format!("Problem with `{}`", id.original_name),
                )
            })
            .collect();
        let mut numbered: Vec<String> = stream.columns.iter().map(|(id, _)| self.typed(&id.name)).collect();
        numbered.push(self.typed(COLUMN_RAW_ID));
        numbered.push(self.typed(COLUMN_EXTRACTED_AT));
        numbered.push(format!("{} AS {}", d.build_meta(&errors), q(COLUMN_META)));
        let dedup = stream.is_dedup();
        if dedup {
            numbered.push(format!(
                "{} AS {}",
                self.row_number(stream, |c| self.typed(c)),
                q(ROW_NUMBER_COLUMN)
            ));
        }

        // Outer level: keep rank 1 and stamp the load time.
        let mut target = vec![
            q(COLUMN_RAW_ID),
            q(COLUMN_EXTRACTED_AT),
            q(COLUMN_LOADED_AT),
            q(COLUMN_META),
        ];
        target.extend(user_columns.iter().cloned());
        let mut projected = vec![
            q(COLUMN_RAW_ID),
            q(COLUMN_EXTRACTED_AT),
            d.current_timestamp(),
            q(COLUMN_META),
        ];
        projected.extend(user_columns);

        let mut sql = format!(
            "INSERT INTO {final_table} ({target})\nSELECT {projected}\nFROM (\n  SELECT\n    {numbered}\n  FROM (\n    SELECT\n      {casts}\n    FROM {raw}\n    WHERE {raw_filter}\n  ) AS {typed_alias}\n) AS {numbered_alias}",
            final_table = final_table,
            target = target.join(", "),
            projected = projected.join(", "),
            numbered = numbered.join(",\n    "),
            casts = casts.join(",\n      "),
            raw = self.raw_table(&stream.id),
            raw_filter = raw_filter,
            typed_alias = q(TYPED_ALIAS),
            numbered_alias = q(NUMBERED_ALIAS),
        );
        if dedup {
            sql.push_str(&format!("\nWHERE {} = 1", q(ROW_NUMBER_COLUMN)));
        }
        sql
    }

    /// Delete every final row that is not the latest for its primary key.
    fn dedup_final_table(&self, stream: &StreamConfig, final_table: &str) -> String {
        let q = |c: &str| self.dialect.quote_ident(c);
        format!(
            "DELETE FROM {final_table}\nWHERE {raw_id} IN (\n  SELECT {raw_id} FROM (\n    SELECT {raw_id}, {row_number} AS {rn}\n    FROM {final_table}\n  ) AS {alias}\n  WHERE {rn} <> 1\n)",
            final_table = final_table,
            raw_id = q(COLUMN_RAW_ID),
            row_number = self.row_number(stream, |c| q(c)),
            rn = q(ROW_NUMBER_COLUMN),
            alias = q("airbyte_ids"),
        )
    }

    fn commit_raw_table(&self, id: &StreamId, min_raw_timestamp: Option<DateTime<Utc>>) -> String {
        let q = |c: &str| self.dialect.quote_ident(c);
        let mut sql = format!(
            "UPDATE {} SET {} = {} WHERE {} IS NULL",
            self.raw_table(id),
            q(COLUMN_LOADED_AT),
            self.dialect.current_timestamp(),
            q(COLUMN_LOADED_AT)
        );
        if let Some(ts) = min_raw_timestamp {
            sql.push_str(&format!(
                " AND {} > {}",
                q(COLUMN_EXTRACTED_AT),
                self.dialect.timestamp_literal(&ts)
            ));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{CatalogParser, DestinationSyncMode, StreamDefinition};
    use crate::core::schema::ExistingColumn;
    use crate::drivers::{MysqlDialect, PostgresDialect, SqliteDialect};
    use chrono::TimeZone;
    use serde_json::json;

    fn definition(sync_mode: DestinationSyncMode) -> StreamDefinition {
        StreamDefinition {
            namespace: Some("public".into()),
            name: "users".into(),
            sync_mode,
            primary_key: vec!["id".into()],
            cursor: Some("updated_at".into()),
            json_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "updated_at": {"type": "integer"},
                    "address": {"type": "object", "properties": {"city": {"type": "string"}}},
                    "_ab_cdc_deleted_at": {"type": ["null", "string"]}
                }
            }),
        }
    }

    fn stream(dialect: DialectImpl, sync_mode: DestinationSyncMode) -> StreamConfig {
        CatalogParser::new(dialect, "airbyte_internal", "public")
            .parse_stream(&definition(sync_mode))
            .unwrap()
    }

    fn pg() -> SqlGenerator {
        SqlGenerator::new(DialectImpl::Postgres(PostgresDialect::new()))
    }

    fn existing_from(columns: &[(String, String)]) -> ExistingTable {
        ExistingTable::new(
            columns
                .iter()
                .map(|(name, ty)| ExistingColumn {
                    name: name.clone(),
                    data_type: ty.clone(),
                })
                .collect(),
        )
    }

    // =========================================================================
    // DDL
    // =========================================================================

    #[test]
    fn test_create_table_lists_meta_then_declared_columns() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        let sql = gen.create_table(&stream, "", false).unwrap();
        let ddl = sql.statements().next().unwrap();

        assert!(ddl.starts_with("CREATE TABLE \"public\".\"users\" ("));
        let raw_id = ddl.find("\"_airbyte_raw_id\"").unwrap();
        let id = ddl.find("\"id\" bigint").unwrap();
        assert!(raw_id < id);
        assert!(ddl.contains("\"address\" jsonb"));
        assert_eq!(sql.transactions().len(), 1);
    }

    #[test]
    fn test_forced_create_drops_first_in_one_transaction() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        let sql = gen.create_table(&stream, SOFT_RESET_SUFFIX, true).unwrap();
        assert_eq!(sql.transactions().len(), 1);
        let group = &sql.transactions()[0];
        assert_eq!(group[0], "DROP TABLE IF EXISTS \"public\".\"users_ab_soft_reset\"");
        assert!(group[1].starts_with("CREATE TABLE \"public\".\"users_ab_soft_reset\""));
    }

    #[test]
    fn test_create_schema_unsupported_on_sqlite() {
        let gen = SqlGenerator::new(DialectImpl::Sqlite(SqliteDialect::new()));
        assert!(gen.create_schema("main").unwrap_err().is_unsupported());
        assert_eq!(
            pg().create_schema("analytics").unwrap().statements().next(),
            Some("CREATE SCHEMA IF NOT EXISTS \"analytics\"")
        );
    }

    // =========================================================================
    // Schema comparison
    // =========================================================================

    #[test]
    fn test_matching_schema_needs_no_ddl() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        let existing = existing_from(&gen.expected_columns(&stream));
        assert!(gen.existing_schema_matches(&stream, &existing).unwrap());
        assert!(gen.prepare_final_table(&stream, Some(&existing)).unwrap().is_empty());
    }

    #[test]
    fn test_type_drift_triggers_soft_reset() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        let mut columns = gen.expected_columns(&stream);
        columns.last_mut().unwrap().1 = "integer".into();
        let existing = existing_from(&columns);

        assert!(!gen.existing_schema_matches(&stream, &existing).unwrap());
        let sql = gen.prepare_final_table(&stream, Some(&existing)).unwrap();
        let all: Vec<&str> = sql.statements().collect();
        assert!(all.iter().any(|s| s.contains("users_ab_soft_reset")));
        assert!(all.iter().any(|s| s.contains("SET \"_airbyte_loaded_at\" = NULL")));
    }

    #[test]
    fn test_absent_table_is_created() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::Append);
        let sql = gen.prepare_final_table(&stream, None).unwrap();
        assert!(sql.statements().next().unwrap().starts_with("CREATE TABLE"));
    }

    #[test]
    fn test_mysql_cannot_introspect() {
        let gen = SqlGenerator::new(DialectImpl::Mysql(MysqlDialect::new()));
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        let existing = existing_from(&gen.expected_columns(&stream));
        assert!(gen
            .existing_schema_matches(&stream, &existing)
            .unwrap_err()
            .is_unsupported());
        // Unknown shape is rebuilt.
        let sql = gen.prepare_final_table(&stream, Some(&existing)).unwrap();
        assert!(sql.statements().any(|s| s.contains("users_ab_soft_reset")));
    }

    // =========================================================================
    // Typing and deduplication
    // =========================================================================

    #[test]
    fn test_dedup_update_has_four_steps_in_one_transaction() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        let sql = gen.update_table(&stream, "", None, false).unwrap();

        assert_eq!(sql.transactions().len(), 1);
        let group = &sql.transactions()[0];
        assert_eq!(group.len(), 4);
        assert!(group[0].starts_with("INSERT INTO \"public\".\"users\""));
        assert!(group[0].contains(
            "ROW_NUMBER() OVER (PARTITION BY \"typed\".\"id\" ORDER BY \"typed\".\"updated_at\" DESC NULLS LAST, \"typed\".\"_airbyte_extracted_at\" DESC)"
        ));
        assert!(group[0].ends_with("WHERE \"_airbyte_row_number\" = 1"));
        assert!(group[1].starts_with("DELETE FROM \"public\".\"users\"\nWHERE \"_airbyte_raw_id\" IN"));
        assert_eq!(
            group[2],
            "DELETE FROM \"public\".\"users\" WHERE \"_ab_cdc_deleted_at\" IS NOT NULL"
        );
        assert!(group[3].starts_with("UPDATE \"airbyte_internal\".\"public_raw__stream_users\""));
    }

    #[test]
    fn test_append_skips_dedup_and_cdc() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::Append);
        let sql = gen.update_table(&stream, "", None, false).unwrap();
        let group = &sql.transactions()[0];
        assert_eq!(group.len(), 2);
        assert!(!group[0].contains("ROW_NUMBER"));
        assert!(group[0].contains("Problem with `address`"));
    }

    #[test]
    fn test_struct_column_requires_object_shape() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::Append);
        let sql = gen.update_table(&stream, "", None, false).unwrap();
        let insert = sql.statements().next().unwrap();
        assert!(insert.contains(
            "CASE WHEN jsonb_typeof((\"_airbyte_data\" -> 'address')) = 'object' THEN (\"_airbyte_data\" -> 'address') ELSE NULL END AS \"address\""
        ));
    }

    #[test]
    fn test_min_timestamp_bounds_insert_and_commit() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let sql = gen.update_table(&stream, "", Some(ts), false).unwrap();
        let bound = "\"_airbyte_extracted_at\" > CAST('2024-01-02T03:04:05.000000Z' AS timestamp with time zone)";
        let group = &sql.transactions()[0];
        assert!(group[0].contains(bound));
        assert!(group[3].contains(bound));
    }

    #[test]
    fn test_safe_casting_is_forced_without_fast_path() {
        let gen = SqlGenerator::new(DialectImpl::Sqlite(SqliteDialect::new()));
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        assert_eq!(
            gen.update_table(&stream, "", None, false).unwrap(),
            gen.update_table(&stream, "", None, true).unwrap()
        );

        let gen = pg();
        let stream = self::stream(gen.dialect().clone(), DestinationSyncMode::AppendDedup);
        assert_ne!(
            gen.update_table(&stream, "", None, false).unwrap(),
            gen.update_table(&stream, "", None, true).unwrap()
        );
    }

    // =========================================================================
    // Swap and raw table maintenance
    // =========================================================================

    #[test]
    fn test_overwrite_swap() {
        let gen = pg();
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::Overwrite);
        let sql = gen
            .overwrite_final_table(&stream.id, TMP_OVERWRITE_SUFFIX)
            .unwrap();
        assert_eq!(
            sql.transactions()[0],
            vec![
                "DROP TABLE IF EXISTS \"public\".\"users\"".to_string(),
                "ALTER TABLE \"public\".\"users_airbyte_tmp\" RENAME TO \"users\"".to_string(),
            ]
        );
        assert!(gen.overwrite_final_table(&stream.id, "").unwrap().is_empty());
    }

    #[test]
    fn test_long_stream_names_keep_transient_tables_distinct() {
        let gen = pg();
        let mut def = definition(DestinationSyncMode::AppendDedup);
        def.name = "x".repeat(70);
        let stream = CatalogParser::new(gen.dialect().clone(), "airbyte_internal", "public")
            .parse_stream(&def)
            .unwrap();
        let final_table = gen.final_table(&stream.id, "");
        assert_eq!(stream.id.final_name.len(), 63);

        let rebuild = gen.create_table(&stream, SOFT_RESET_SUFFIX, true).unwrap();
        let drop = &rebuild.transactions()[0][0];
        assert!(drop.starts_with("DROP TABLE IF EXISTS"));
        assert!(!drop.ends_with(&final_table));

        let soft = gen.final_table(&stream.id, SOFT_RESET_SUFFIX);
        let tmp = gen.final_table(&stream.id, TMP_OVERWRITE_SUFFIX);
        for table in [&soft, &tmp] {
            assert_ne!(table, &final_table);
            // "public"."<name>": the name itself must fit in 63 bytes.
            let name = table.trim_start_matches("\"public\".").trim_matches('"');
            assert!(name.len() <= 63, "{} is {} bytes", name, name.len());
        }

        let swap = gen.overwrite_final_table(&stream.id, SOFT_RESET_SUFFIX).unwrap();
        assert_eq!(swap.transactions()[0][0], format!("DROP TABLE IF EXISTS {}", final_table));
        assert!(swap.transactions()[0][1].starts_with(&format!("ALTER TABLE {} RENAME", soft)));
    }

    #[test]
    fn test_raw_table_maintenance() {
        let gen = SqlGenerator::new(DialectImpl::Sqlite(SqliteDialect::new()));
        let stream = stream(gen.dialect().clone(), DestinationSyncMode::Append);
        let add = gen.migrate_raw_add_meta_column(&stream.id);
        assert_eq!(
            add.statements().next(),
            Some("ALTER TABLE \"main\".\"airbyte_internal_public_raw__stream_users\" ADD COLUMN \"_airbyte_meta\" JSON")
        );
        let normalize = gen.normalize_extracted_at_to_utc(&stream.id).unwrap();
        assert!(normalize.statements().next().unwrap().contains("NOT LIKE '%Z'"));

        assert!(pg().normalize_extracted_at_to_utc(&stream.id).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_build_column_id_avoids_meta_columns() {
        let gen = pg();
        assert_eq!(gen.build_column_id("_airbyte_meta").name, "_airbyte_meta_1");
        assert_eq!(gen.build_column_id("email").name, "email");
        let id = gen.build_stream_id("sales", "orders", "airbyte_internal");
        assert_eq!(id.raw_name, "sales_raw__stream_orders");
    }
}
