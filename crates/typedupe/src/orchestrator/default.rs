//! Full typer/deduper: migrations, final-table preparation, typing passes
//! and commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lock::{RawTableInsertLock, StreamLocks};
use super::pool::TypingPool;
use super::{StreamSyncSummary, TyperDeduper};
use crate::core::catalog::{DestinationSyncMode, ParsedCatalog, StreamConfig};
use crate::core::identifier::{StreamDescriptor, StreamId};
use crate::core::schema::DestinationInitialState;
use crate::core::traits::{DestinationHandler, Dialect};
use crate::error::{Result, TypeDedupeError};
use crate::generator::{SOFT_RESET_SUFFIX, TMP_OVERWRITE_SUFFIX};
use crate::migration::{execute_raw_table_migrations, Migration};
use crate::state::DestinationState;

/// Where and how a stream is typed during this sync.
#[derive(Debug, Clone, Default)]
struct StreamPlan {
    /// Suffix of the table typing writes into; empty for the real final table.
    suffix: String,
    /// Only raw rows extracted after this instant are considered.
    lower_bound: Option<DateTime<Utc>>,
    /// Raw rows were waiting to be typed when the sync started.
    has_unprocessed: bool,
    /// A typing pass has completed since the plan was made.
    typed: bool,
}

impl StreamPlan {
    /// The stream writes into a transient table swapped in at commit.
    fn rebuild_pending(&self) -> bool {
        !self.suffix.is_empty()
    }
}

/// State shared with spawned jobs.
struct Shared<S: DestinationState> {
    destination: Arc<dyn DestinationHandler<S>>,
    catalog: ParsedCatalog,
    locks: HashMap<StreamId, StreamLocks>,
    plans: Mutex<HashMap<StreamId, StreamPlan>>,
}

impl<S: DestinationState> Shared<S> {
    fn locks(&self, id: &StreamId) -> Result<&StreamLocks> {
        self.locks
            .get(id)
            .ok_or_else(|| TypeDedupeError::StreamNotFound(id.to_string()))
    }

    /// One typing pass for a stream, holding its typing slot and the
    /// exclusive side of its insert lock.
    ///
    /// Without `must_run` the pass is skipped when another one is running.
    async fn type_and_dedupe_within_lock(&self, stream: &StreamConfig, must_run: bool) -> Result<()> {
        let id = &stream.id;
        let locks = self.locks(id)?;

        let Some(_slot) = locks.typing_slot(must_run).await else {
            info!("{}: another typing pass is running, skipping", id);
            return Ok(());
        };
        let _exclusive = locks.exclusive().await;

        let plan = self.plans.lock().await.get(id).cloned().unwrap_or_default();
        self.execute_typing(stream, &plan).await?;

        if let Some(plan) = self.plans.lock().await.get_mut(id) {
            plan.typed = true;
        }
        Ok(())
    }

    /// Run the typing transaction with plain casts, falling back to safe
    /// casts once if the destination rejects it.
    async fn execute_typing(&self, stream: &StreamConfig, plan: &StreamPlan) -> Result<()> {
        let generator = self.destination.generator();
        let id = &stream.id;
        let started = std::time::Instant::now();

        let fast = generator.update_table(stream, &plan.suffix, plan.lower_bound, false)?;
        let result = match self.destination.execute(&fast).await {
            Ok(()) => Ok(()),
            Err(e) if generator.dialect().supports_fast_casting() => {
                warn!(
                    "{}: typing with plain casts failed, retrying with safe casts: {}",
                    id, e
                );
                let safe = generator.update_table(stream, &plan.suffix, plan.lower_bound, true)?;
                self.destination.execute(&safe).await
            }
            Err(e) => Err(e),
        };

        result.map_err(|e| TypeDedupeError::typing(id.to_string(), e.to_string()))?;
        info!(
            "{}: typed and deduplicated into {} in {:.2}s",
            id,
            generator.final_table(id, &plan.suffix),
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Swap a transient table into place, typing it first if nothing has.
    async fn commit_stream(&self, stream: &StreamConfig) -> Result<()> {
        let id = &stream.id;
        let plan = self.plans.lock().await.get(id).cloned().unwrap_or_default();
        if !plan.rebuild_pending() {
            return Ok(());
        }
        if !plan.typed {
            self.type_and_dedupe_within_lock(stream, true).await?;
        }

        let locks = self.locks(id)?;
        let _exclusive = locks.exclusive().await;
        let generator = self.destination.generator();
        self.destination
            .execute(&generator.overwrite_final_table(id, &plan.suffix)?)
            .await?;
        info!(
            "{}: swapped {} into place",
            id,
            generator.final_table(id, &plan.suffix)
        );

        if let Some(plan) = self.plans.lock().await.get_mut(id) {
            plan.suffix.clear();
        }
        Ok(())
    }
}

/// Typer/deduper that materializes final tables.
///
/// One instance per sync. The worker pool and the per-stream locks belong to
/// the instance and are released by [`cleanup`](TyperDeduper::cleanup) or on
/// drop.
pub struct DefaultTyperDeduper<S: DestinationState> {
    shared: Arc<Shared<S>>,
    migrations: Vec<Box<dyn Migration<S>>>,
    pool: TypingPool,
    cancel: CancellationToken,
    initial_states: Vec<DestinationInitialState<S>>,
    soft_resets: HashMap<StreamId, bool>,
    prepared: HashSet<StreamId>,
}

impl<S: DestinationState> DefaultTyperDeduper<S> {
    pub fn new(
        destination: Arc<dyn DestinationHandler<S>>,
        catalog: ParsedCatalog,
        migrations: Vec<Box<dyn Migration<S>>>,
        threads: usize,
    ) -> Self {
        Self::with_cancellation(destination, catalog, migrations, threads, CancellationToken::new())
    }

    pub fn with_cancellation(
        destination: Arc<dyn DestinationHandler<S>>,
        catalog: ParsedCatalog,
        migrations: Vec<Box<dyn Migration<S>>>,
        threads: usize,
        cancel: CancellationToken,
    ) -> Self {
        let locks = catalog
            .iter()
            .map(|s| (s.id.clone(), StreamLocks::default()))
            .collect();
        Self {
            shared: Arc::new(Shared {
                destination,
                catalog,
                locks,
                plans: Mutex::new(HashMap::new()),
            }),
            migrations,
            pool: TypingPool::new(threads, cancel.clone()),
            cancel,
            initial_states: Vec::new(),
            soft_resets: HashMap::new(),
            prepared: HashSet::new(),
        }
    }

    pub fn catalog(&self) -> &ParsedCatalog {
        &self.shared.catalog
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TypeDedupeError::Cancelled);
        }
        Ok(())
    }

    /// Decide how one stream's final table is prepared and emit the DDL.
    async fn prepare_stream(&self, initial: &DestinationInitialState<S>) -> Result<StreamPlan> {
        let stream = &initial.stream;
        let id = &stream.id;
        let generator = self.shared.destination.generator();
        let soft_reset = self.soft_resets.get(id).copied().unwrap_or(false);

        let mut plan = StreamPlan {
            suffix: String::new(),
            lower_bound: initial.raw_table.typing_lower_bound(),
            has_unprocessed: initial.raw_table.has_unprocessed_records(),
            typed: false,
        };

        if !initial.is_final_table_present {
            info!("{}: creating final table", id);
            self.shared
                .destination
                .execute(&generator.create_table(stream, "", false)?)
                .await?;
            return Ok(plan);
        }

        if stream.sync_mode == DestinationSyncMode::Overwrite {
            if !initial.is_final_table_empty || initial.is_schema_mismatch {
                info!(
                    "{}: final table has data or a different shape, building into {}",
                    id, TMP_OVERWRITE_SUFFIX
                );
                self.shared
                    .destination
                    .execute(&generator.create_table(stream, TMP_OVERWRITE_SUFFIX, true)?)
                    .await?;
                plan.suffix = TMP_OVERWRITE_SUFFIX.to_string();
                plan.lower_bound = None;
            }
            return Ok(plan);
        }

        if initial.is_schema_mismatch || soft_reset {
            info!(
                "{}: {}, rebuilding into {}",
                id,
                if initial.is_schema_mismatch {
                    "schema changed"
                } else {
                    "a migration requested a soft reset"
                },
                SOFT_RESET_SUFFIX
            );
            self.shared
                .destination
                .execute(&generator.prepare_tables_for_soft_reset(stream)?)
                .await?;
            plan.suffix = SOFT_RESET_SUFFIX.to_string();
            plan.lower_bound = None;
            plan.has_unprocessed = true;
            return Ok(plan);
        }

        debug!("{}: final table is up to date", id);
        Ok(plan)
    }
}

#[async_trait]
impl<S: DestinationState> TyperDeduper for DefaultTyperDeduper<S> {
    async fn execute_raw_table_migrations(&mut self) -> Result<()> {
        self.check_cancelled()?;
        info!("Phase 1: Preparing schemas and running raw table migrations");
        let outcome = execute_raw_table_migrations(
            self.shared.destination.as_ref(),
            &self.migrations,
            &self.shared.catalog,
        )
        .await?;
        self.initial_states = outcome.initial_states;
        self.soft_resets = outcome.soft_resets;
        Ok(())
    }

    async fn prepare_final_tables(&mut self) -> Result<()> {
        self.check_cancelled()?;
        if self.initial_states.is_empty() && !self.shared.catalog.is_empty() {
            // Migrations were not run; gather the state directly.
            let streams: Vec<StreamConfig> = self.shared.catalog.iter().cloned().collect();
            self.initial_states = self.shared.destination.gather_initial_state(&streams).await?;
        }

        info!("Phase 2: Preparing {} final tables", self.initial_states.len());
        let mut plans = HashMap::with_capacity(self.initial_states.len());
        for initial in &self.initial_states {
            self.check_cancelled()?;
            let plan = self.prepare_stream(initial).await?;
            self.prepared.insert(initial.stream.id.clone());
            plans.insert(initial.stream.id.clone(), plan);
        }
        *self.shared.plans.lock().await = plans;
        Ok(())
    }

    async fn type_and_dedupe_stream(
        &self,
        namespace: Option<&str>,
        name: &str,
        must_run: bool,
    ) -> Result<()> {
        let stream = self.shared.catalog.get(namespace, name)?;
        if !self.prepared.contains(&stream.id) {
            info!("{}: final table was not prepared, skipping typing", stream.id);
            return Ok(());
        }
        self.shared.type_and_dedupe_within_lock(stream, must_run).await
    }

    async fn type_and_dedupe(
        &self,
        summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()> {
        self.check_cancelled()?;
        info!("Phase 3: Typing and deduplicating with {} workers", self.pool.size());

        let plans = self.shared.plans.lock().await.clone();
        let mut jobs = Vec::new();
        for stream in self.shared.catalog.iter() {
            let id = &stream.id;
            if !self.prepared.contains(id) {
                continue;
            }
            let plan = plans.get(id).cloned().unwrap_or_default();
            let records_written = summaries
                .get(&id.descriptor())
                .and_then(|s| s.records_written);
            let should_run = records_written.map_or(true, |n| n > 0)
                || plan.has_unprocessed
                || plan.rebuild_pending();
            if !should_run {
                info!("{}: no new records, skipping typing", id);
                continue;
            }

            let shared = self.shared.clone();
            let stream = stream.clone();
            jobs.push((id.to_string(), async move {
                shared.type_and_dedupe_within_lock(&stream, false).await
            }));
        }

        self.pool.run_all(jobs).await
    }

    async fn commit_final_tables(&mut self) -> Result<()> {
        self.check_cancelled()?;
        info!("Phase 4: Committing final tables");

        let mut jobs = Vec::new();
        for stream in self.shared.catalog.iter() {
            if !self.prepared.contains(&stream.id) {
                continue;
            }
            let shared = self.shared.clone();
            let stream = stream.clone();
            jobs.push((stream.id.to_string(), async move {
                shared.commit_stream(&stream).await
            }));
        }

        self.pool.run_all(jobs).await
    }

    fn raw_table_insert_lock(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<RawTableInsertLock> {
        let stream = self.shared.catalog.get(namespace, name)?;
        Ok(self.shared.locks(&stream.id)?.insert_lock(stream.id.to_string()))
    }

    async fn cleanup(&mut self) {
        info!("Phase 5: Cleaning up");
        self.pool.shutdown();
    }
}
