//! MySQL driver.
//!
//! Only the SQL dialect is provided: [`MysqlDialect`] generates typing and
//! deduplication SQL for MySQL 8.0+, executed by the caller's own connection
//! layer.

mod dialect;

pub use dialect::MysqlDialect;
