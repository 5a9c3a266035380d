//! Typer/deduper lifecycle.
//!
//! One [`TyperDeduper`] per sync, driven by the caller in this order:
//!
//! 1. [`execute_raw_table_migrations`](TyperDeduper::execute_raw_table_migrations)
//! 2. [`prepare_final_tables`](TyperDeduper::prepare_final_tables)
//! 3. [`type_and_dedupe_stream`](TyperDeduper::type_and_dedupe_stream) while
//!    records arrive, then [`type_and_dedupe`](TyperDeduper::type_and_dedupe)
//! 4. [`commit_final_tables`](TyperDeduper::commit_final_tables)
//! 5. [`cleanup`](TyperDeduper::cleanup), also after a failure
//!
//! [`TyperDeduperImpl`] selects the full or the no-op behavior at
//! construction and dispatches by match.

mod default;
mod lock;
mod noop;
mod pool;

pub use default::DefaultTyperDeduper;
pub use lock::{RawTableInsertGuard, RawTableInsertLock};
pub use noop::NoOpTyperDeduper;
pub use pool::TypingPool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::core::catalog::ParsedCatalog;
use crate::core::identifier::StreamDescriptor;
use crate::core::traits::DestinationHandler;
use crate::error::Result;
use crate::migration::Migration;
use crate::state::DestinationState;

/// What the producer side reports about a stream at the end of a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSyncSummary {
    /// Records appended to the raw table; `None` when unknown.
    pub records_written: Option<u64>,
}

impl StreamSyncSummary {
    pub fn new(records_written: u64) -> Self {
        Self {
            records_written: Some(records_written),
        }
    }
}

/// Lifecycle of typing and deduplication for one sync.
#[async_trait]
pub trait TyperDeduper: Send + Sync {
    /// Create schemas and raw tables, migrate them and persist the state.
    async fn execute_raw_table_migrations(&mut self) -> Result<()>;

    /// Create, migrate or schedule a rebuild of every final table.
    async fn prepare_final_tables(&mut self) -> Result<()>;

    /// Type one stream's pending raw rows.
    ///
    /// Without `must_run` the call returns immediately when another pass for
    /// the same stream is in progress.
    async fn type_and_dedupe_stream(
        &self,
        namespace: Option<&str>,
        name: &str,
        must_run: bool,
    ) -> Result<()>;

    /// Type every stream with something to do, in parallel.
    async fn type_and_dedupe(
        &self,
        summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()>;

    /// Swap rebuilt tables into place.
    async fn commit_final_tables(&mut self) -> Result<()>;

    /// Lock a producer holds while appending to a stream's raw table.
    fn raw_table_insert_lock(&self, namespace: Option<&str>, name: &str)
        -> Result<RawTableInsertLock>;

    /// Release the worker pool. Idempotent.
    async fn cleanup(&mut self);
}

/// Full or no-op typer/deduper, chosen at construction.
pub enum TyperDeduperImpl<S: DestinationState> {
    Default(DefaultTyperDeduper<S>),
    NoOp(NoOpTyperDeduper<S>),
}

impl<S: DestinationState> TyperDeduperImpl<S> {
    /// Build the no-op variant when `disable_type_dedupe` is set.
    pub fn new(
        destination: Arc<dyn DestinationHandler<S>>,
        catalog: ParsedCatalog,
        migrations: Vec<Box<dyn Migration<S>>>,
        threads: usize,
        disable_type_dedupe: bool,
        cancel: CancellationToken,
    ) -> Self {
        if disable_type_dedupe {
            Self::NoOp(NoOpTyperDeduper::with_cancellation(
                destination,
                catalog,
                migrations,
                cancel,
            ))
        } else {
            Self::Default(DefaultTyperDeduper::with_cancellation(
                destination,
                catalog,
                migrations,
                threads,
                cancel,
            ))
        }
    }

    pub fn catalog(&self) -> &ParsedCatalog {
        match self {
            Self::Default(t) => t.catalog(),
            Self::NoOp(t) => t.catalog(),
        }
    }

    /// Run the whole lifecycle once, always cleaning up.
    pub async fn run(
        &mut self,
        summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()> {
        let result = self.run_steps(summaries).await;
        if let Err(e) = &result {
            error!("Typing and deduplication failed: {}", e);
        }
        self.cleanup().await;
        result
    }

    async fn run_steps(
        &mut self,
        summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()> {
        self.execute_raw_table_migrations().await?;
        self.prepare_final_tables().await?;
        self.type_and_dedupe(summaries).await?;
        self.commit_final_tables().await
    }
}

#[async_trait]
impl<S: DestinationState> TyperDeduper for TyperDeduperImpl<S> {
    async fn execute_raw_table_migrations(&mut self) -> Result<()> {
        match self {
            Self::Default(t) => t.execute_raw_table_migrations().await,
            Self::NoOp(t) => t.execute_raw_table_migrations().await,
        }
    }

    async fn prepare_final_tables(&mut self) -> Result<()> {
        match self {
            Self::Default(t) => t.prepare_final_tables().await,
            Self::NoOp(t) => t.prepare_final_tables().await,
        }
    }

    async fn type_and_dedupe_stream(
        &self,
        namespace: Option<&str>,
        name: &str,
        must_run: bool,
    ) -> Result<()> {
        match self {
            Self::Default(t) => t.type_and_dedupe_stream(namespace, name, must_run).await,
            Self::NoOp(t) => t.type_and_dedupe_stream(namespace, name, must_run).await,
        }
    }

    async fn type_and_dedupe(
        &self,
        summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()> {
        match self {
            Self::Default(t) => t.type_and_dedupe(summaries).await,
            Self::NoOp(t) => t.type_and_dedupe(summaries).await,
        }
    }

    async fn commit_final_tables(&mut self) -> Result<()> {
        match self {
            Self::Default(t) => t.commit_final_tables().await,
            Self::NoOp(t) => t.commit_final_tables().await,
        }
    }

    fn raw_table_insert_lock(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<RawTableInsertLock> {
        match self {
            Self::Default(t) => t.raw_table_insert_lock(namespace, name),
            Self::NoOp(t) => t.raw_table_insert_lock(namespace, name),
        }
    }

    async fn cleanup(&mut self) {
        match self {
            Self::Default(t) => t.cleanup().await,
            Self::NoOp(t) => t.cleanup().await,
        }
    }
}
