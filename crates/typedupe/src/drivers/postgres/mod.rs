//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL syntax strategy for PostgreSQL
//! - [`PostgresDestinationHandler`]: destination handler over a deadpool pool
//!   (requires the `postgres` feature)
//! - [`tls`]: rustls connector selection from `ssl_mode`

mod dialect;
#[cfg(feature = "postgres")]
mod handler;
#[cfg(feature = "postgres")]
pub mod tls;

pub use dialect::PostgresDialect;
#[cfg(feature = "postgres")]
pub use handler::PostgresDestinationHandler;
#[cfg(feature = "postgres")]
pub use tls::{make_connector, SslMode};
