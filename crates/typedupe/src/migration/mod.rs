//! Versioned raw-table migrations.
//!
//! A [`Migration`] evolves the raw table of a stream (its layout or its rows)
//! and the stream's state blob across releases. Migrations run in a fixed
//! order per stream; each one returns a [`MigrationResult`] carrying the
//! updated state and whether the final table must be rebuilt. The runner
//! folds those results so that a stream gets at most one soft reset, no
//! matter how many migrations asked for it.
//!
//! # Two-phase check
//!
//! 1. [`Migration::require_migration`] reads the state blob only. It is a hint
//!    and is logged, never trusted on its own.
//! 2. [`Migration::migrate_if_necessary`] confirms against the destination
//!    before mutating anything. A previous run may have mutated the raw table
//!    and then died before its state was committed (or the reverse), so the
//!    runner always calls it.
//!
//! Migrations never execute a soft reset themselves.

mod extracted_at;
mod raw_meta;

pub use extracted_at::ExtractedAtUtcMigration;
pub use raw_meta::RawMetaColumnMigration;

use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::catalog::{ParsedCatalog, StreamConfig};
use crate::core::identifier::StreamId;
use crate::core::schema::DestinationInitialState;
use crate::core::sql::Sql;
use crate::core::traits::DestinationHandler;
use crate::error::{Result, TypeDedupeError};
use crate::state::{DestinationState, ExtractedAtUtcState, RawMetaColumnState};

/// Outcome of one migration (or of a folded sequence).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult<S> {
    pub updated_state: S,
    /// The final table must be rebuilt from the raw table.
    pub soft_reset: bool,
}

impl<S> MigrationResult<S> {
    pub fn new(updated_state: S, soft_reset: bool) -> Self {
        Self {
            updated_state,
            soft_reset,
        }
    }

    /// Nothing to do: state unchanged, no soft reset.
    pub fn noop(state: S) -> Self {
        Self::new(state, false)
    }
}

/// One raw-table migration.
#[async_trait]
pub trait Migration<S: DestinationState>: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether the state blob suggests this migration is pending. No I/O.
    fn require_migration(&self, state: &S) -> bool;

    /// Confirm against the destination and migrate the raw table if needed.
    ///
    /// Must only touch the raw table and must not run a soft reset; request
    /// one through the result instead.
    async fn migrate_if_necessary(
        &self,
        destination: &dyn DestinationHandler<S>,
        state: &S,
        stream: &StreamConfig,
    ) -> Result<MigrationResult<S>>;
}

/// The migrations shipped with this crate, in application order.
pub fn default_migrations<S>() -> Vec<Box<dyn Migration<S>>>
where
    S: RawMetaColumnState + ExtractedAtUtcState,
{
    vec![
        Box::new(RawMetaColumnMigration),
        Box::new(ExtractedAtUtcMigration),
    ]
}

/// Run every migration for one stream, threading the state through.
///
/// Returns the final state and the OR of every soft-reset request. Any
/// failure aborts the sequence and is reported as a migration error; the
/// caller must not commit state for this stream in that case.
pub async fn run_migrations<S: DestinationState>(
    destination: &dyn DestinationHandler<S>,
    migrations: &[Box<dyn Migration<S>>],
    stream: &StreamConfig,
    state: S,
) -> Result<MigrationResult<S>> {
    let mut current = state;
    let mut soft_reset = false;

    for migration in migrations {
        if migration.require_migration(&current) {
            debug!("{}: state reports {} as pending", stream.id, migration.name());
        } else {
            debug!(
                "{}: state reports {} as applied, confirming against the destination",
                stream.id,
                migration.name()
            );
        }

        let result = migration
            .migrate_if_necessary(destination, &current, stream)
            .await
            .map_err(|e| match e {
                TypeDedupeError::Migration { .. } => e,
                other => TypeDedupeError::migration(
                    stream.id.to_string(),
                    migration.name(),
                    other.to_string(),
                ),
            })?;

        if result.soft_reset {
            info!("{}: {} requested a soft reset", stream.id, migration.name());
        }
        current = result.updated_state;
        soft_reset |= result.soft_reset;
    }

    Ok(MigrationResult::new(current, soft_reset))
}

/// Outcome of the raw-table migration phase for a whole catalog.
#[derive(Debug)]
pub struct RawTableMigrations<S> {
    /// Initial state per stream, with the migrated state blob substituted.
    pub initial_states: Vec<DestinationInitialState<S>>,
    /// Streams whose migrations requested a soft reset.
    pub soft_resets: HashMap<StreamId, bool>,
}

/// Prepare schemas and raw tables, then migrate every stream.
///
/// Each stream's state is committed as soon as its own sequence succeeds;
/// a failing stream commits nothing and its error is returned after the
/// remaining streams have been migrated.
pub async fn execute_raw_table_migrations<S: DestinationState>(
    destination: &dyn DestinationHandler<S>,
    migrations: &[Box<dyn Migration<S>>],
    catalog: &ParsedCatalog,
) -> Result<RawTableMigrations<S>> {
    prepare_schemas(destination, catalog).await?;

    let streams: Vec<StreamConfig> = catalog.iter().cloned().collect();
    let gathered = destination.gather_initial_state(&streams).await?;

    let mut initial_states = Vec::with_capacity(gathered.len());
    let mut soft_resets = HashMap::with_capacity(gathered.len());
    let mut first_error: Option<TypeDedupeError> = None;

    for mut initial in gathered {
        let stream = initial.stream.clone();
        match run_migrations(
            destination,
            migrations,
            &stream,
            initial.destination_state.clone(),
        )
        .await
        {
            Ok(result) => {
                let mut commit = HashMap::with_capacity(1);
                commit.insert(stream.id.clone(), result.updated_state.clone());
                destination.commit_destination_states(&commit).await?;

                soft_resets.insert(stream.id.clone(), result.soft_reset);
                initial.destination_state = result.updated_state;
            }
            Err(e) => {
                warn!("Raw table migrations failed for {}: {}", stream.id, e);
                soft_resets.insert(stream.id.clone(), false);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        initial_states.push(initial);
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    Ok(RawTableMigrations {
        initial_states,
        soft_resets,
    })
}

/// Create every raw and final namespace, then every raw table.
///
/// Dialects without `CREATE SCHEMA` skip the first step.
async fn prepare_schemas<S: DestinationState>(
    destination: &dyn DestinationHandler<S>,
    catalog: &ParsedCatalog,
) -> Result<()> {
    let generator = destination.generator();

    let mut seen = HashSet::new();
    let namespaces: Vec<&str> = catalog
        .iter()
        .flat_map(|s| [s.id.raw_namespace.as_str(), s.id.final_namespace.as_str()])
        .filter(|ns| seen.insert(*ns))
        .collect();

    let mut batches = Vec::with_capacity(namespaces.len() + catalog.len());
    for namespace in namespaces {
        match generator.create_schema(namespace) {
            Ok(sql) => batches.push(sql),
            Err(e) if e.is_unsupported() => {
                debug!("Skipping schema creation: {}", e);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    for stream in catalog.iter() {
        batches.push(generator.create_raw_table(&stream.id)?);
    }

    destination.execute(&Sql::concat(batches)).await
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::core::catalog::{CatalogParser, StreamDefinition};
    use crate::core::{StateHandler, StreamDescriptor};
    use crate::drivers::{DialectImpl, SqliteDestinationHandler, SqliteDialect};
    use crate::state::TypingDedupingState;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedMigration {
        name: &'static str,
        soft_reset: bool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedMigration {
        fn new(name: &'static str, soft_reset: bool) -> Self {
            Self {
                name,
                soft_reset,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Migration<TypingDedupingState> for FixedMigration {
        fn name(&self) -> &str {
            self.name
        }

        fn require_migration(&self, _state: &TypingDedupingState) -> bool {
            true
        }

        async fn migrate_if_necessary(
            &self,
            _destination: &dyn DestinationHandler<TypingDedupingState>,
            state: &TypingDedupingState,
            _stream: &StreamConfig,
        ) -> Result<MigrationResult<TypingDedupingState>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TypeDedupeError::destination("boom", "fixed migration"));
            }
            Ok(MigrationResult::new(
                state.with_raw_meta_column_added(true),
                self.soft_reset,
            ))
        }
    }

    fn catalog() -> ParsedCatalog {
        CatalogParser::new(
            DialectImpl::Sqlite(SqliteDialect::new()),
            "airbyte_internal",
            "public",
        )
        .parse(&[StreamDefinition {
            namespace: Some("public".into()),
            name: "users".into(),
            sync_mode: Default::default(),
            primary_key: vec![],
            cursor: None,
            json_schema: json!({"properties": {"id": {"type": "integer"}}}),
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn test_soft_reset_flags_are_folded() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let catalog = catalog();
        let stream = &catalog.streams[0];
        let migrations: Vec<Box<dyn Migration<TypingDedupingState>>> = vec![
            Box::new(FixedMigration::new("a", true)),
            Box::new(FixedMigration::new("b", false)),
            Box::new(FixedMigration::new("c", true)),
        ];

        let dest: &dyn DestinationHandler<TypingDedupingState> = &handler;
        let result = run_migrations(dest, &migrations, stream, TypingDedupingState::default())
            .await
            .unwrap();
        assert!(result.soft_reset);
        assert_eq!(result.updated_state.raw_meta_column_added, Some(true));
    }

    #[tokio::test]
    async fn test_failure_names_stream_and_migration() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let catalog = catalog();
        let mut failing = FixedMigration::new("broken", false);
        failing.fail = true;
        let migrations: Vec<Box<dyn Migration<TypingDedupingState>>> = vec![Box::new(failing)];

        let dest: &dyn DestinationHandler<TypingDedupingState> = &handler;
        let err = run_migrations(
            dest,
            &migrations,
            &catalog.streams[0],
            TypingDedupingState::default(),
        )
        .await
        .unwrap_err();
        match err {
            TypeDedupeError::Migration {
                stream, migration, ..
            } => {
                assert_eq!(stream, "public.users");
                assert_eq!(migration, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failed_sequence_commits_no_state() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let catalog = catalog();
        let mut failing = FixedMigration::new("second", false);
        failing.fail = true;
        let migrations: Vec<Box<dyn Migration<TypingDedupingState>>> = vec![
            Box::new(FixedMigration::new("first", false)),
            Box::new(failing),
        ];

        let dest: &dyn DestinationHandler<TypingDedupingState> = &handler;
        let err = execute_raw_table_migrations(dest, &migrations, &catalog)
            .await
            .unwrap_err();
        assert!(matches!(err, TypeDedupeError::Migration { .. }));

        let states = load_states(&handler).await;
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_successful_sequence_commits_state_and_creates_raw_table() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let catalog = catalog();
        let migrations: Vec<Box<dyn Migration<TypingDedupingState>>> =
            vec![Box::new(FixedMigration::new("only", true))];

        let dest: &dyn DestinationHandler<TypingDedupingState> = &handler;
        let outcome = execute_raw_table_migrations(dest, &migrations, &catalog)
            .await
            .unwrap();
        let id = &catalog.streams[0].id;
        assert_eq!(outcome.soft_resets.get(id), Some(&true));
        assert!(outcome.initial_states[0].raw_table.raw_table_exists);
        assert_eq!(
            outcome.initial_states[0].destination_state.raw_meta_column_added,
            Some(true)
        );

        let states = load_states(&handler).await;
        assert_eq!(states[&id.descriptor()].raw_meta_column_added, Some(true));
    }

    async fn load_states(
        handler: &SqliteDestinationHandler,
    ) -> HashMap<StreamDescriptor, TypingDedupingState> {
        StateHandler::<TypingDedupingState>::get_states(handler)
            .await
            .unwrap()
    }
}
