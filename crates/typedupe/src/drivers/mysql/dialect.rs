//! MySQL SQL dialect (Strategy pattern).
//!
//! Raw payloads are `JSON`; properties are read with `JSON_EXTRACT` and
//! classified with `JSON_TYPE`. MySQL has no `CREATE SCHEMA` distinct from
//! databases and no column-shape introspection here, so both report
//! unsupported and callers fall back conservatively.
//!
//! Compatible with MySQL 8.0+ (window functions are required for dedup).

use chrono::{DateTime, Utc};

use crate::core::identifier::quote_mysql;
use crate::core::traits::{Dialect, JsonShape};
use crate::core::types::PrimitiveType;

const MYSQL_MAX_IDENTIFIER_LENGTH: usize = 64;

/// MySQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    /// Create a new MySQL dialect instance.
    pub fn new() -> Self {
        Self
    }

    fn path(&self, key: &str) -> String {
        let escaped = key.replace('\\', "\\\\").replace('"', "\\\"");
        self.string_literal(&format!("$.\"{}\"", escaped))
    }

    fn value(&self, data: &str, key: &str) -> String {
        format!("JSON_EXTRACT({}, {})", data, self.path(key))
    }

    fn text(&self, data: &str, key: &str) -> String {
        format!("JSON_UNQUOTE({})", self.value(data, key))
    }

    fn typeof_expr(&self, data: &str, key: &str) -> String {
        format!("JSON_TYPE({})", self.value(data, key))
    }

    fn regexp_cast(&self, data: &str, key: &str, pattern: &str, target: &str) -> String {
        let text = self.text(data, key);
        format!(
            "CASE WHEN {} REGEXP {} THEN CAST({} AS {}) ELSE NULL END",
            text,
            self.string_literal(pattern),
            text,
            target
        )
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_mysql(name)
    }

    // MySQL treats backslash as an escape inside string literals.
    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn max_identifier_length(&self) -> usize {
        MYSQL_MAX_IDENTIFIER_LENGTH
    }

    fn case_insensitive_identifiers(&self) -> bool {
        true
    }

    fn supports_create_schema(&self) -> bool {
        false
    }

    fn supports_schema_introspection(&self) -> bool {
        false
    }

    fn supports_fast_casting(&self) -> bool {
        true
    }

    fn primitive_type(&self, ty: PrimitiveType) -> &'static str {
        match ty {
            PrimitiveType::String => "TEXT",
            PrimitiveType::Boolean => "BOOLEAN",
            PrimitiveType::Integer => "BIGINT",
            PrimitiveType::Number => "DECIMAL(38, 9)",
            PrimitiveType::Date => "DATE",
            PrimitiveType::TimeWithTimezone => "VARCHAR(64)",
            PrimitiveType::TimeWithoutTimezone => "TIME(6)",
            PrimitiveType::TimestampWithTimezone => "TIMESTAMP(6)",
            PrimitiveType::TimestampWithoutTimezone => "DATETIME(6)",
            PrimitiveType::Unknown => "JSON",
        }
    }

    fn json_type(&self) -> &'static str {
        "JSON"
    }

    fn timestamp_type(&self) -> &'static str {
        "TIMESTAMP(6)"
    }

    fn raw_id_type(&self) -> &'static str {
        "VARCHAR(256)"
    }

    fn extract_json(&self, data: &str, key: &str) -> String {
        self.value(data, key)
    }

    fn json_has_shape(&self, data: &str, key: &str, shape: JsonShape) -> String {
        let expected = match shape {
            JsonShape::Object => "'OBJECT'",
            JsonShape::Array => "'ARRAY'",
        };
        format!("{} = {}", self.typeof_expr(data, key), expected)
    }

    fn json_is_present(&self, data: &str, key: &str) -> String {
        format!("COALESCE({}, 'NULL') <> 'NULL'", self.typeof_expr(data, key))
    }

    fn cast_primitive(&self, data: &str, key: &str, ty: PrimitiveType, safe: bool) -> String {
        let text = self.text(data, key);
        match ty {
            PrimitiveType::String => format!(
                "CASE WHEN {t} IN ('OBJECT', 'ARRAY') THEN CAST({v} AS CHAR) \
                 WHEN {t} = 'NULL' THEN NULL ELSE {text} END",
                t = self.typeof_expr(data, key),
                v = self.value(data, key),
                text = text
            ),
            PrimitiveType::Unknown => format!(
                "CASE WHEN {} THEN {} ELSE NULL END",
                self.json_is_present(data, key),
                self.value(data, key)
            ),
            PrimitiveType::Boolean => format!(
                "CASE WHEN LOWER({text}) = 'true' THEN TRUE \
                 WHEN LOWER({text}) = 'false' THEN FALSE ELSE NULL END",
                text = text
            ),
            PrimitiveType::TimeWithTimezone => text,
            _ if !safe => {
                let target = match ty {
                    PrimitiveType::Integer => "SIGNED",
                    PrimitiveType::Number => "DECIMAL(38, 9)",
                    PrimitiveType::Date => "DATE",
                    PrimitiveType::TimeWithoutTimezone => "TIME(6)",
                    _ => "DATETIME(6)",
                };
                format!("CAST({} AS {})", text, target)
            }
            PrimitiveType::Integer => self.regexp_cast(data, key, "^-?[0-9]+$", "SIGNED"),
            PrimitiveType::Number => self.regexp_cast(
                data,
                key,
                "^-?([0-9]+(\\.[0-9]*)?|\\.[0-9]+)([eE][-+]?[0-9]+)?$",
                "DECIMAL(38, 9)",
            ),
            PrimitiveType::Date => {
                self.regexp_cast(data, key, "^[0-9]{4}-[0-9]{2}-[0-9]{2}$", "DATE")
            }
            PrimitiveType::TimeWithoutTimezone => {
                self.regexp_cast(data, key, "^[0-9]{2}:[0-9]{2}(:[0-9]{2}(\\.[0-9]+)?)?$", "TIME(6)")
            }
            PrimitiveType::TimestampWithTimezone | PrimitiveType::TimestampWithoutTimezone => self
                .regexp_cast(
                    data,
                    key,
                    "^[0-9]{4}-[0-9]{2}-[0-9]{2}[T ][0-9]{2}:[0-9]{2}(:[0-9]{2}(\\.[0-9]+)?)?",
                    "DATETIME(6)",
                ),
        }
    }

    fn build_meta(&self, errors: &[(String, String)]) -> String {
        if errors.is_empty() {
            return "JSON_OBJECT('errors', JSON_ARRAY())".to_string();
        }
        let cases: Vec<String> = errors
            .iter()
            .map(|(condition, message)| {
                format!(
                    "CASE WHEN {} THEN JSON_QUOTE({}) ELSE NULL END",
                    condition,
                    self.string_literal(message)
                )
            })
            .collect();
        format!(
            "JSON_OBJECT('errors', CAST(CONCAT('[', CONCAT_WS(',', {}), ']') AS JSON))",
            cases.join(",\n        ")
        )
    }

    fn current_timestamp(&self) -> String {
        "CURRENT_TIMESTAMP(6)".to_string()
    }

    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String {
        format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.6f"))
    }

    fn order_desc_nulls_last(&self, expr: &str) -> String {
        format!("{} IS NULL, {} DESC", expr, expr)
    }

    fn rename_table(&self, namespace: &str, from: &str, to: &str) -> String {
        format!(
            "RENAME TABLE {} TO {}",
            self.qualify(namespace, from),
            self.qualify(namespace, to)
        )
    }
}
