//! Core abstractions shared by every dialect and destination.
//!
//! - [`types`]: logical type model of a stream schema
//! - [`identifier`]: identifier quoting and stream/column name resolution
//! - [`catalog`]: stream configuration and catalog parsing
//! - [`schema`]: destination metadata (introspected tables, watermarks)
//! - [`sql`]: ordered, transaction-grouped SQL batches
//! - [`traits`]: dialect, destination handler and state handler traits
//!
//! # Design Patterns
//!
//! - **Strategy**: `Dialect` supplies per-engine syntax to one shared generator
//! - **Template Method**: default trait methods define the common layout
//!   (stream naming, rename, ordering) that dialects override selectively

pub mod catalog;
pub mod identifier;
pub mod schema;
pub mod sql;
pub mod traits;
pub mod types;

pub use catalog::{
    CatalogParser, DestinationSyncMode, ParsedCatalog, StreamConfig, StreamDefinition,
    DEFAULT_RAW_NAMESPACE,
};
pub use identifier::{ColumnId, StreamDescriptor, StreamId};
pub use schema::{
    DestinationInitialState, ExistingColumn, ExistingTable, RawRecord, RawTableWatermark,
};
pub use sql::Sql;
pub use traits::{DestinationHandler, Dialect, JsonShape, StateHandler, UtcNormalization};
pub use types::{LogicalType, PrimitiveType};
