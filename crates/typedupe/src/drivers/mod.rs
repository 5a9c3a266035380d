//! Destination driver implementations.
//!
//! - [`postgres`]: PostgreSQL dialect and destination handler
//! - [`mysql`]: MySQL dialect (SQL generation only)
//! - [`sqlite`]: SQLite dialect and destination handler
//!
//! # Architecture
//!
//! Each driver module implements `Dialect`, the SQL syntax strategy consumed
//! by the shared generator. Drivers with a live connection layer also
//! implement `DestinationHandler`, gated behind a Cargo feature so callers
//! only compile the database clients they use.
//!
//! # Adding New Destinations
//!
//! 1. Create a new module under `drivers/` (e.g., `drivers/duckdb/`)
//! 2. Implement `Dialect` (and optionally `DestinationHandler`)
//! 3. Add an enum variant to `DialectImpl` and a name to `from_db_type`
//! 4. Gate the handler with a feature flag in `Cargo.toml`

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use chrono::{DateTime, Utc};

pub use mysql::MysqlDialect;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDestinationHandler;
pub use postgres::PostgresDialect;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDestinationHandler;
pub use sqlite::SqliteDialect;

use crate::core::identifier::{ColumnNameResolver, StreamId};
use crate::core::traits::{Dialect, JsonShape, UtcNormalization};
use crate::core::types::PrimitiveType;
use crate::error::{Result, TypeDedupeError};

/// Enum-based static dispatch for dialects.
///
/// The compiler generates a match per call instead of vtable dispatch, and
/// the enum stays `Clone` so generators can be built cheaply per run.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Postgres(PostgresDialect),
    Mysql(MysqlDialect),
    Sqlite(SqliteDialect),
}

macro_rules! delegate {
    ($self:ident, $d:ident => $call:expr) => {
        match $self {
            DialectImpl::Postgres($d) => $call,
            DialectImpl::Mysql($d) => $call,
            DialectImpl::Sqlite($d) => $call,
        }
    };
}

impl Dialect for DialectImpl {
    fn name(&self) -> &str {
        delegate!(self, d => d.name())
    }

    fn quote_ident(&self, name: &str) -> String {
        delegate!(self, d => d.quote_ident(name))
    }

    fn qualify(&self, namespace: &str, name: &str) -> String {
        delegate!(self, d => d.qualify(namespace, name))
    }

    fn string_literal(&self, value: &str) -> String {
        delegate!(self, d => d.string_literal(value))
    }

    fn max_identifier_length(&self) -> usize {
        delegate!(self, d => d.max_identifier_length())
    }

    fn case_insensitive_identifiers(&self) -> bool {
        delegate!(self, d => d.case_insensitive_identifiers())
    }

    fn build_stream_id(
        &self,
        namespace: Option<&str>,
        name: &str,
        default_namespace: &str,
        raw_namespace: &str,
    ) -> StreamId {
        delegate!(self, d => d.build_stream_id(namespace, name, default_namespace, raw_namespace))
    }

    fn column_resolver(&self, reserved: &[&str]) -> ColumnNameResolver {
        delegate!(self, d => d.column_resolver(reserved))
    }

    fn supports_create_schema(&self) -> bool {
        delegate!(self, d => d.supports_create_schema())
    }

    fn supports_schema_introspection(&self) -> bool {
        delegate!(self, d => d.supports_schema_introspection())
    }

    fn supports_fast_casting(&self) -> bool {
        delegate!(self, d => d.supports_fast_casting())
    }

    fn primitive_type(&self, ty: PrimitiveType) -> &'static str {
        delegate!(self, d => d.primitive_type(ty))
    }

    fn json_type(&self) -> &'static str {
        delegate!(self, d => d.json_type())
    }

    fn timestamp_type(&self) -> &'static str {
        delegate!(self, d => d.timestamp_type())
    }

    fn raw_id_type(&self) -> &'static str {
        delegate!(self, d => d.raw_id_type())
    }

    fn extract_json(&self, data: &str, key: &str) -> String {
        delegate!(self, d => d.extract_json(data, key))
    }

    fn json_has_shape(&self, data: &str, key: &str, shape: JsonShape) -> String {
        delegate!(self, d => d.json_has_shape(data, key, shape))
    }

    fn json_is_present(&self, data: &str, key: &str) -> String {
        delegate!(self, d => d.json_is_present(data, key))
    }

    fn cast_primitive(&self, data: &str, key: &str, ty: PrimitiveType, safe: bool) -> String {
        delegate!(self, d => d.cast_primitive(data, key, ty, safe))
    }

    fn build_meta(&self, errors: &[(String, String)]) -> String {
        delegate!(self, d => d.build_meta(errors))
    }

    fn current_timestamp(&self) -> String {
        delegate!(self, d => d.current_timestamp())
    }

    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String {
        delegate!(self, d => d.timestamp_literal(ts))
    }

    fn order_desc_nulls_last(&self, expr: &str) -> String {
        delegate!(self, d => d.order_desc_nulls_last(expr))
    }

    fn rename_table(&self, namespace: &str, from: &str, to: &str) -> String {
        delegate!(self, d => d.rename_table(namespace, from, to))
    }

    fn utc_normalization(&self, column: &str) -> Option<UtcNormalization> {
        delegate!(self, d => d.utc_normalization(column))
    }
}

impl DialectImpl {
    /// Create a dialect implementation from a destination type string.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination type is not recognized.
    pub fn from_db_type(db_type: &str) -> Result<Self> {
        match db_type.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(DialectImpl::Postgres(PostgresDialect::new())),
            "mysql" | "mariadb" => Ok(DialectImpl::Mysql(MysqlDialect::new())),
            "sqlite" | "sqlite3" => Ok(DialectImpl::Sqlite(SqliteDialect::new())),
            other => Err(TypeDedupeError::Config(format!(
                "Unknown destination type: '{}'. Supported types: postgres, mysql, sqlite",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_impl_from_db_type() {
        assert_eq!(DialectImpl::from_db_type("postgres").unwrap().name(), "postgres");
        assert_eq!(DialectImpl::from_db_type("mysql").unwrap().name(), "mysql");
        assert_eq!(DialectImpl::from_db_type("sqlite").unwrap().name(), "sqlite");

        // Alternative names
        assert!(DialectImpl::from_db_type("PostgreSQL").is_ok());
        assert!(DialectImpl::from_db_type("pg").is_ok());
        assert!(DialectImpl::from_db_type("mariadb").is_ok());
        assert!(DialectImpl::from_db_type("sqlite3").is_ok());

        let err = DialectImpl::from_db_type("oracle").unwrap_err();
        assert!(err.to_string().contains("Supported types"));
    }

    #[test]
    fn test_dialect_impl_dispatch() {
        let dialect = DialectImpl::Postgres(PostgresDialect::new());
        assert_eq!(dialect.quote_ident("table"), "\"table\"");
        assert!(dialect.supports_fast_casting());

        let dialect = DialectImpl::Mysql(MysqlDialect::new());
        assert_eq!(dialect.quote_ident("table"), "`table`");
        assert!(dialect.utc_normalization("`c`").is_none());

        let dialect = DialectImpl::Sqlite(SqliteDialect::new());
        let id = dialect.build_stream_id(None, "users", "public", "airbyte_internal");
        assert_eq!(id.final_namespace, "main");
        assert!(dialect.utc_normalization("\"c\"").is_some());
    }
}
