//! PostgreSQL SQL dialect (Strategy pattern).
//!
//! Raw payloads are `jsonb`. Properties are read with `->` and rendered as
//! text with `#>> '{}'`, which unquotes scalars and serializes objects and
//! arrays. Plain casts raise on bad input, so the fast path is a bare `CAST`
//! and the safe path guards every cast with a `jsonb_typeof` check and a
//! regular expression. A pattern match alone does not make a cast safe, so
//! integers are range-checked through `numeric` and calendar dates are
//! rebuilt with date arithmetic (which cannot raise) and compared back.

use chrono::{DateTime, Utc};

use crate::core::identifier::quote_ansi;
use crate::core::traits::{Dialect, JsonShape};
use crate::core::types::PrimitiveType;

/// PostgreSQL limits identifiers to 63 bytes (NAMEDATALEN - 1).
const PG_MAX_IDENTIFIER_LENGTH: usize = 63;

const BIGINT_MIN: &str = "-9223372036854775808";
const BIGINT_MAX: &str = "9223372036854775807";

const INTEGER_PATTERN: &str = r"^\s*-?[0-9]+\s*$";
// Exponents are capped well inside numeric's range.
const NUMBER_PATTERN: &str = r"^\s*-?([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][-+]?[0-9]{1,4})?\s*$";
const BOOLEAN_PATTERN: &str = r"^\s*(true|false)\s*$";
// Field ranges are enforced here; day-of-month is checked separately.
const DATE_PATTERN: &str = r"^(?!0000)\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])$";
const TIMESTAMP_PATTERN: &str = r"^(?!0000)\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])[T ]([01]\d|2[0-3]):[0-5]\d(:[0-5]\d(\.\d+)?)?(Z|[+-](0\d|1[0-5])(:?[0-5]\d)?)?$";
const TIME_PATTERN: &str =
    r"^([01]\d|2[0-3]):[0-5]\d(:[0-5]\d(\.\d+)?)?(Z|[+-](0\d|1[0-5])(:?[0-5]\d)?)?$";

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Create a new PostgreSQL dialect instance.
    pub fn new() -> Self {
        Self
    }

    fn value(&self, data: &str, key: &str) -> String {
        format!("({} -> {})", data, self.string_literal(key))
    }

    fn text(&self, data: &str, key: &str) -> String {
        format!("({} #>> '{{}}')", self.value(data, key))
    }

    fn typeof_expr(&self, data: &str, key: &str) -> String {
        format!("jsonb_typeof({})", self.value(data, key))
    }

    /// `CAST` behind a type and pattern check. `check`, when given, is only
    /// evaluated once the pattern matched, so it may cast the text itself.
    fn guarded_cast(
        &self,
        data: &str,
        key: &str,
        json_types: &str,
        pattern: &str,
        check: Option<String>,
        sql_type: &str,
    ) -> String {
        let text = self.text(data, key);
        let cast = format!("CAST({} AS {})", text, sql_type);
        let then = match check {
            Some(check) => format!("CASE WHEN {} THEN {} ELSE NULL END", check, cast),
            None => cast,
        };
        format!(
            "CASE WHEN {} IN ({}) AND {} ~* {} THEN {} ELSE NULL END",
            self.typeof_expr(data, key),
            json_types,
            text,
            self.string_literal(pattern),
            then
        )
    }

    fn bigint_in_range(&self, text: &str) -> String {
        format!(
            "CAST({} AS numeric) BETWEEN {} AND {}",
            text, BIGINT_MIN, BIGINT_MAX
        )
    }

    /// True when the leading `YYYY-MM-DD` of `text` names a real day. The day
    /// is added to the first of the month, so `2024-02-30` becomes
    /// `2024-03-01` and no longer matches.
    fn valid_calendar_day(&self, text: &str) -> String {
        format!(
            "to_char(CAST(substr({t}, 1, 8) || '01' AS date) + (CAST(substr({t}, 9, 2) AS integer) - 1), 'YYYY-MM-DD') = substr({t}, 1, 10)",
            t = text
        )
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_ansi(name)
    }

    fn max_identifier_length(&self) -> usize {
        PG_MAX_IDENTIFIER_LENGTH
    }

    fn case_insensitive_identifiers(&self) -> bool {
        false
    }

    fn supports_create_schema(&self) -> bool {
        true
    }

    fn supports_schema_introspection(&self) -> bool {
        true
    }

    fn supports_fast_casting(&self) -> bool {
        true
    }

    // Type names match information_schema.columns.data_type so introspected
    // shapes compare directly against expected shapes.
    fn primitive_type(&self, ty: PrimitiveType) -> &'static str {
        match ty {
            PrimitiveType::String => "text",
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Integer => "bigint",
            PrimitiveType::Number => "numeric",
            PrimitiveType::Date => "date",
            PrimitiveType::TimeWithTimezone => "time with time zone",
            PrimitiveType::TimeWithoutTimezone => "time without time zone",
            PrimitiveType::TimestampWithTimezone => "timestamp with time zone",
            PrimitiveType::TimestampWithoutTimezone => "timestamp without time zone",
            PrimitiveType::Unknown => "jsonb",
        }
    }

    fn json_type(&self) -> &'static str {
        "jsonb"
    }

    fn timestamp_type(&self) -> &'static str {
        "timestamp with time zone"
    }

    fn raw_id_type(&self) -> &'static str {
        "character varying"
    }

    fn extract_json(&self, data: &str, key: &str) -> String {
        self.value(data, key)
    }

    fn json_has_shape(&self, data: &str, key: &str, shape: JsonShape) -> String {
        let expected = match shape {
            JsonShape::Object => "'object'",
            JsonShape::Array => "'array'",
        };
        format!("{} = {}", self.typeof_expr(data, key), expected)
    }

    fn json_is_present(&self, data: &str, key: &str) -> String {
        format!("COALESCE({}, 'null') <> 'null'", self.typeof_expr(data, key))
    }

    fn cast_primitive(&self, data: &str, key: &str, ty: PrimitiveType, safe: bool) -> String {
        let sql_type = self.primitive_type(ty);
        match ty {
            PrimitiveType::String => self.text(data, key),
            PrimitiveType::Unknown => {
                format!(
                    "CASE WHEN {} THEN {} ELSE NULL END",
                    self.json_is_present(data, key),
                    self.value(data, key)
                )
            }
            _ if !safe => format!("CAST({} AS {})", self.text(data, key), sql_type),
            PrimitiveType::Integer => self.guarded_cast(
                data,
                key,
                "'number', 'string'",
                INTEGER_PATTERN,
                Some(self.bigint_in_range(&self.text(data, key))),
                sql_type,
            ),
            PrimitiveType::Number => {
                self.guarded_cast(data, key, "'number', 'string'", NUMBER_PATTERN, None, sql_type)
            }
            PrimitiveType::Boolean => {
                self.guarded_cast(data, key, "'boolean', 'string'", BOOLEAN_PATTERN, None, sql_type)
            }
            PrimitiveType::Date => self.guarded_cast(
                data,
                key,
                "'string'",
                DATE_PATTERN,
                Some(self.valid_calendar_day(&self.text(data, key))),
                sql_type,
            ),
            PrimitiveType::TimestampWithTimezone | PrimitiveType::TimestampWithoutTimezone => self
                .guarded_cast(
                    data,
                    key,
                    "'string'",
                    TIMESTAMP_PATTERN,
                    Some(self.valid_calendar_day(&self.text(data, key))),
                    sql_type,
                ),
            PrimitiveType::TimeWithTimezone | PrimitiveType::TimeWithoutTimezone => {
                self.guarded_cast(data, key, "'string'", TIME_PATTERN, None, sql_type)
            }
        }
    }

    fn build_meta(&self, errors: &[(String, String)]) -> String {
        if errors.is_empty() {
            return "jsonb_build_object('errors', jsonb_build_array())".to_string();
        }
        let cases: Vec<String> = errors
            .iter()
            .map(|(condition, message)| {
                format!(
                    "CASE WHEN {} THEN {} ELSE NULL END",
                    condition,
                    self.string_literal(message)
                )
            })
            .collect();
        format!(
            "jsonb_build_object('errors', to_jsonb(ARRAY_REMOVE(ARRAY[{}]::text[], NULL)))",
            cases.join(",\n        ")
        )
    }

    fn current_timestamp(&self) -> String {
        "CURRENT_TIMESTAMP".to_string()
    }

    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String {
        format!(
            "CAST('{}' AS timestamp with time zone)",
            ts.format("%Y-%m-%dT%H:%M:%S%.6fZ")
        )
    }
}
