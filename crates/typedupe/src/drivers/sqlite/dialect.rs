//! SQLite SQL dialect (Strategy pattern).
//!
//! SQLite stores the raw payload as JSON text and timestamps as ISO-8601
//! text (`YYYY-MM-DDTHH:MM:SS.SSSZ`), which sorts correctly only while every
//! value is in UTC. Casts never raise in SQLite (`CAST('abc' AS NUMERIC)` is
//! `0`), so there is no fast path: every cast is guarded on `json_type` and
//! validated with SQLite's own date and JSON functions. Those functions are
//! lenient (`date('now')`, Julian day numbers, `2024-02-30` rolling over to
//! March), so temporal text must match an ISO-8601 shape and its date part
//! must survive `date()` unchanged.
//!
//! SQLite has no schemas beyond attached databases. Everything lives in
//! `main`; the stream namespace is folded into the table name.

use chrono::{DateTime, Utc};

use crate::core::identifier::{quote_ansi, truncate_with_hash, StreamId, MAX_IDENTIFIER_LENGTH};
use crate::core::traits::{Dialect, JsonShape, UtcNormalization};
use crate::core::types::PrimitiveType;

/// The only schema tables are created in.
pub const SQLITE_MAIN_SCHEMA: &str = "main";

/// strftime format of stored timestamps.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%fZ";

const DATE_GLOB: &str = "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]";
const TIMESTAMP_GLOB: &str = "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9][T ][0-9][0-9]:[0-9][0-9]*";
const TIME_GLOB: &str = "[0-9][0-9]:[0-9][0-9]*";

/// Render a timestamp the way SQLite tables store it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// SQLite dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Create a new SQLite dialect instance.
    pub fn new() -> Self {
        Self
    }

    fn path(&self, key: &str) -> String {
        self.string_literal(&format!("$.\"{}\"", key))
    }

    fn type_of(&self, data: &str, key: &str) -> String {
        format!("json_type({}, {})", data, self.path(key))
    }

    fn scalar(&self, data: &str, key: &str) -> String {
        format!("json_extract({}, {})", data, self.path(key))
    }

    /// `CASE` that applies `expr` only when the property is a JSON string
    /// matching `glob` and passing `check`.
    fn when_text(&self, data: &str, key: &str, glob: &str, check: &str, expr: &str) -> String {
        format!(
            "CASE WHEN {} = 'text' AND {} GLOB {} AND {} THEN {} ELSE NULL END",
            self.type_of(data, key),
            self.scalar(data, key),
            self.string_literal(glob),
            check,
            expr
        )
    }

    /// The leading `YYYY-MM-DD` names a real day and the hour, if any, is
    /// below 24.
    fn valid_date_time(&self, v: &str) -> String {
        format!(
            "date(substr({v}, 1, 10)) = substr({v}, 1, 10) \
             AND (length({v}) = 10 OR substr({v}, 12, 2) < '24')",
            v = v
        )
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_ansi(name)
    }

    fn max_identifier_length(&self) -> usize {
        MAX_IDENTIFIER_LENGTH
    }

    fn case_insensitive_identifiers(&self) -> bool {
        true
    }

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
            final_namespace: SQLITE_MAIN_SCHEMA.to_string(),
            final_name: truncate_with_hash(&format!("{}_{}", ns, name), max),
            raw_namespace: SQLITE_MAIN_SCHEMA.to_string(),
            raw_name: truncate_with_hash(
                &format!("{}_{}_raw__stream_{}", raw_namespace, ns, name),
                max,
            ),
            original_namespace: namespace.map(str::to_string),
            original_name: name.to_string(),
        }
    }

    fn supports_create_schema(&self) -> bool {
        false
    }

    fn supports_schema_introspection(&self) -> bool {
        true
    }

    fn supports_fast_casting(&self) -> bool {
        false
    }

    // Declared types are reported verbatim by PRAGMA table_info.
    fn primitive_type(&self, ty: PrimitiveType) -> &'static str {
        match ty {
            PrimitiveType::String => "TEXT",
            PrimitiveType::Boolean => "BOOLEAN",
            PrimitiveType::Integer => "INTEGER",
            PrimitiveType::Number => "NUMERIC",
            PrimitiveType::Date => "DATE",
            PrimitiveType::TimeWithTimezone => "TIMETZ",
            PrimitiveType::TimeWithoutTimezone => "TIME",
            PrimitiveType::TimestampWithTimezone => "TIMESTAMPTZ",
            PrimitiveType::TimestampWithoutTimezone => "TIMESTAMP",
            PrimitiveType::Unknown => "JSON",
        }
    }

    fn json_type(&self) -> &'static str {
        "JSON"
    }

    fn timestamp_type(&self) -> &'static str {
        "TEXT"
    }

    fn raw_id_type(&self) -> &'static str {
        "TEXT"
    }

    fn extract_json(&self, data: &str, key: &str) -> String {
        format!("({} -> {})", data, self.path(key))
    }

    fn json_has_shape(&self, data: &str, key: &str, shape: JsonShape) -> String {
        let expected = match shape {
            JsonShape::Object => "'object'",
            JsonShape::Array => "'array'",
        };
        format!("{} = {}", self.type_of(data, key), expected)
    }

    fn json_is_present(&self, data: &str, key: &str) -> String {
        format!("COALESCE({}, 'null') <> 'null'", self.type_of(data, key))
    }

    fn cast_primitive(&self, data: &str, key: &str, ty: PrimitiveType, _safe: bool) -> String {
        let t = self.type_of(data, key);
        let v = self.scalar(data, key);
        match ty {
            PrimitiveType::String => format!(
                "CASE {t} WHEN 'text' THEN {v} WHEN 'null' THEN NULL \
                 WHEN 'true' THEN 'true' WHEN 'false' THEN 'false' \
                 ELSE {json} END",
                t = t,
                v = v,
                json = self.extract_json(data, key)
            ),
            PrimitiveType::Integer => format!(
                "CASE {t} WHEN 'integer' THEN CASE WHEN typeof({v}) = 'integer' THEN {v} ELSE NULL END \
                 WHEN 'real' THEN CASE WHEN {v} = CAST({v} AS INTEGER) THEN CAST({v} AS INTEGER) ELSE NULL END \
                 WHEN 'text' THEN CASE WHEN CAST(CAST({v} AS INTEGER) AS TEXT) = trim({v}) THEN CAST({v} AS INTEGER) ELSE NULL END \
                 ELSE NULL END",
                t = t,
                v = v
            ),
            PrimitiveType::Number => format!(
                "CASE {t} WHEN 'integer' THEN {v} WHEN 'real' THEN {v} \
                 WHEN 'text' THEN CASE WHEN json_valid(trim({v})) THEN \
                 CASE WHEN json_type(trim({v})) IN ('integer', 'real') THEN CAST(trim({v}) AS NUMERIC) ELSE NULL END \
                 ELSE NULL END \
                 ELSE NULL END",
                t = t,
                v = v
            ),
            PrimitiveType::Boolean => format!(
                "CASE {t} WHEN 'true' THEN 1 WHEN 'false' THEN 0 \
                 WHEN 'text' THEN CASE lower(trim({v})) WHEN 'true' THEN 1 WHEN 'false' THEN 0 ELSE NULL END \
                 ELSE NULL END",
                t = t,
                v = v
            ),
            PrimitiveType::Date => {
                self.when_text(data, key, DATE_GLOB, &self.valid_date_time(&v), &format!("date({})", v))
            }
            PrimitiveType::TimestampWithTimezone => self.when_text(
                data,
                key,
                TIMESTAMP_GLOB,
                &self.valid_date_time(&v),
                &format!("strftime('{}', {})", TIMESTAMP_FORMAT, v),
            ),
            PrimitiveType::TimestampWithoutTimezone => self.when_text(
                data,
                key,
                TIMESTAMP_GLOB,
                &self.valid_date_time(&v),
                &format!("strftime('%Y-%m-%dT%H:%M:%f', {})", v),
            ),
            PrimitiveType::TimeWithTimezone => self.when_text(
                data,
                key,
                TIME_GLOB,
                &format!("substr({}, 1, 2) < '24'", v),
                &format!("strftime('%H:%M:%fZ', {})", v),
            ),
            PrimitiveType::TimeWithoutTimezone => self.when_text(
                data,
                key,
                TIME_GLOB,
                &format!("substr({}, 1, 2) < '24'", v),
                &format!("strftime('%H:%M:%f', {})", v),
            ),
            PrimitiveType::Unknown => format!(
                "CASE WHEN {} THEN {} ELSE NULL END",
                self.json_is_present(data, key),
                self.extract_json(data, key)
            ),
        }
    }

    fn build_meta(&self, errors: &[(String, String)]) -> String {
        if errors.is_empty() {
            return "json_object('errors', json_array())".to_string();
        }
        let pieces: Vec<String> = errors
            .iter()
            .map(|(condition, message)| {
                format!(
                    "CASE WHEN {} THEN json_quote({}) || ',' ELSE '' END",
                    condition,
                    self.string_literal(message)
                )
            })
            .collect();
        format!(
            "json_object('errors', json('[' || rtrim({}, ',') || ']'))",
            pieces.join("\n        || ")
        )
    }

    fn current_timestamp(&self) -> String {
        format!("strftime('{}', 'now')", TIMESTAMP_FORMAT)
    }

    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String {
        format!("'{}'", format_timestamp(ts))
    }

    fn utc_normalization(&self, column: &str) -> Option<UtcNormalization> {
        Some(UtcNormalization {
            predicate: format!("{} NOT LIKE '%Z'", column),
            expression: format!("strftime('{}', {})", TIMESTAMP_FORMAT, column),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DATA: &str = "\"_airbyte_data\"";

    #[test]
    fn test_stream_id_folds_namespace() {
        let dialect = SqliteDialect::new();
        let id = dialect.build_stream_id(Some("public"), "users", "public", "airbyte_internal");
        assert_eq!(id.final_namespace, "main");
        assert_eq!(id.final_name, "public_users");
        assert_eq!(id.raw_namespace, "main");
        assert_eq!(id.raw_name, "airbyte_internal_public_raw__stream_users");
    }

    #[test]
    fn test_json_path() {
        let dialect = SqliteDialect::new();
        assert_eq!(
            dialect.extract_json(DATA, "age"),
            "(\"_airbyte_data\" -> '$.\"age\"')"
        );
    }

    #[test]
    fn test_no_fast_casting() {
        let dialect = SqliteDialect::new();
        assert!(!dialect.supports_fast_casting());
        assert_eq!(
            dialect.cast_primitive(DATA, "age", PrimitiveType::Number, false),
            dialect.cast_primitive(DATA, "age", PrimitiveType::Number, true)
        );
    }

    #[test]
    fn test_temporal_casts_require_iso_shape() {
        let dialect = SqliteDialect::new();
        let date = dialect.cast_primitive(DATA, "d", PrimitiveType::Date, true);
        assert!(date.contains("GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]'"));
        assert!(date.contains("= substr("));

        let ts = dialect.cast_primitive(DATA, "ts", PrimitiveType::TimestampWithTimezone, true);
        assert!(ts.contains("[T ][0-9][0-9]:[0-9][0-9]*'"));
        assert!(ts.contains("< '24'"));

        let time = dialect.cast_primitive(DATA, "t", PrimitiveType::TimeWithoutTimezone, true);
        assert!(time.contains("GLOB '[0-9][0-9]:[0-9][0-9]*'"));
    }

    #[test]
    fn test_meta_concatenates_pieces() {
        let dialect = SqliteDialect::new();
        let meta = dialect.build_meta(&[
            ("a IS NULL".into(), "Problem with `a`".into()),
            ("b IS NULL".into(), "Problem with `b`".into()),
        ]);
        assert!(meta.starts_with("json_object('errors', json('[' || rtrim("));
        assert_eq!(meta.matches("json_quote").count(), 2);
    }

    #[test]
    fn test_timestamp_literal_matches_storage_format() {
        let dialect = SqliteDialect::new();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(dialect.timestamp_literal(&ts), "'2024-03-01T12:00:00.000Z'");
    }

    #[test]
    fn test_utc_normalization_available() {
        let dialect = SqliteDialect::new();
        let rewrite = dialect.utc_normalization("\"_airbyte_extracted_at\"").unwrap();
        assert!(rewrite.predicate.contains("NOT LIKE '%Z'"));
        assert!(rewrite.expression.starts_with("strftime("));
    }
}
