//! # typedupe
//!
//! Typing and deduplication of raw warehouse tables.
//!
//! Raw, semi-structured records land in a per-stream raw table. This library
//! materializes a typed, deduplicated final table from it across several SQL
//! dialects, with support for:
//!
//! - **Safe casting**: values that fail to parse become NULL and are recorded
//!   in the row's `_airbyte_meta` column instead of failing the sync
//! - **Deduplication** by primary key, latest cursor first
//! - **Soft resets**: full rebuilds into a transient table swapped in at commit
//! - **Raw table migrations** with per-stream persisted state
//! - **Parallel typing** on a bounded worker pool, with raw table insert locks
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use typedupe::{
//!     default_migrations, Config, SqliteDestinationHandler, TyperDeduperImpl,
//!     TypingDedupingState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> typedupe::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let destination = Arc::new(SqliteDestinationHandler::open("warehouse.db")?);
//!     let mut typer = TyperDeduperImpl::<TypingDedupingState>::new(
//!         destination,
//!         config.catalog()?,
//!         default_migrations(),
//!         config.typing.get_threads(),
//!         config.typing.disable_type_dedupe,
//!         CancellationToken::new(),
//!     );
//!     typer.run(&HashMap::new()).await
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod generator;
pub mod migration;
pub mod orchestrator;
pub mod state;

// Re-exports for convenient access
pub use config::{Config, DestinationConfig, TypingConfig};
pub use core::{
    CatalogParser, ColumnId, DestinationHandler, DestinationInitialState, DestinationSyncMode,
    Dialect, LogicalType, ParsedCatalog, PrimitiveType, RawRecord, RawTableWatermark, Sql,
    StateHandler, StreamConfig, StreamDefinition, StreamDescriptor, StreamId,
};
#[cfg(feature = "postgres")]
pub use drivers::PostgresDestinationHandler;
#[cfg(feature = "sqlite")]
pub use drivers::SqliteDestinationHandler;
pub use drivers::DialectImpl;
pub use error::{Result, TypeDedupeError};
pub use generator::SqlGenerator;
pub use migration::{default_migrations, Migration, MigrationResult};
pub use orchestrator::{
    DefaultTyperDeduper, NoOpTyperDeduper, RawTableInsertLock, StreamSyncSummary, TyperDeduper,
    TyperDeduperImpl,
};
pub use state::{DestinationState, TypingDedupingState};
