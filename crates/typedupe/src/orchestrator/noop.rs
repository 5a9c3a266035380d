//! Typer/deduper that only migrates raw tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::lock::RawTableInsertLock;
use super::{StreamSyncSummary, TyperDeduper};
use crate::core::catalog::ParsedCatalog;
use crate::core::identifier::StreamDescriptor;
use crate::core::traits::DestinationHandler;
use crate::error::{Result, TypeDedupeError};
use crate::migration::{execute_raw_table_migrations, Migration};
use crate::state::DestinationState;

/// For destinations that stage raw data only.
///
/// Raw-table migrations still run; preparation, typing and commit succeed
/// without touching the destination, and insert locks never block.
pub struct NoOpTyperDeduper<S: DestinationState> {
    destination: Arc<dyn DestinationHandler<S>>,
    catalog: ParsedCatalog,
    migrations: Vec<Box<dyn Migration<S>>>,
    cancel: CancellationToken,
    warned: AtomicBool,
}

impl<S: DestinationState> NoOpTyperDeduper<S> {
    pub fn new(
        destination: Arc<dyn DestinationHandler<S>>,
        catalog: ParsedCatalog,
        migrations: Vec<Box<dyn Migration<S>>>,
    ) -> Self {
        Self::with_cancellation(destination, catalog, migrations, CancellationToken::new())
    }

    pub fn with_cancellation(
        destination: Arc<dyn DestinationHandler<S>>,
        catalog: ParsedCatalog,
        migrations: Vec<Box<dyn Migration<S>>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            destination,
            catalog,
            migrations,
            cancel,
            warned: AtomicBool::new(false),
        }
    }

    pub fn catalog(&self) -> &ParsedCatalog {
        &self.catalog
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("Typing and deduplication is disabled; only raw tables are maintained");
        }
    }
}

#[async_trait]
impl<S: DestinationState> TyperDeduper for NoOpTyperDeduper<S> {
    async fn execute_raw_table_migrations(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TypeDedupeError::Cancelled);
        }
        info!("Phase 1: Preparing schemas and running raw table migrations");
        execute_raw_table_migrations(self.destination.as_ref(), &self.migrations, &self.catalog)
            .await?;
        Ok(())
    }

    async fn prepare_final_tables(&mut self) -> Result<()> {
        self.warn_once();
        Ok(())
    }

    async fn type_and_dedupe_stream(
        &self,
        namespace: Option<&str>,
        name: &str,
        _must_run: bool,
    ) -> Result<()> {
        self.catalog.get(namespace, name)?;
        self.warn_once();
        Ok(())
    }

    async fn type_and_dedupe(
        &self,
        _summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()> {
        self.warn_once();
        Ok(())
    }

    async fn commit_final_tables(&mut self) -> Result<()> {
        Ok(())
    }

    fn raw_table_insert_lock(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<RawTableInsertLock> {
        let stream = self.catalog.get(namespace, name)?;
        Ok(RawTableInsertLock::noop(stream.id.to_string()))
    }

    async fn cleanup(&mut self) {}
}
