//! SQLite driver.
//!
//! - [`SqliteDialect`]: SQL syntax strategy for SQLite (3.38+ JSON operators)
//! - [`SqliteDestinationHandler`]: destination handler over a single
//!   `rusqlite` connection (requires the `sqlite` feature)

mod dialect;
#[cfg(feature = "sqlite")]
mod handler;

pub use dialect::{format_timestamp, SqliteDialect, SQLITE_MAIN_SCHEMA};
#[cfg(feature = "sqlite")]
pub use handler::SqliteDestinationHandler;
