//! Adds `_airbyte_meta` to raw tables created before the column existed.

use async_trait::async_trait;
use tracing::info;

use super::{Migration, MigrationResult};
use crate::core::catalog::StreamConfig;
use crate::core::schema::COLUMN_META;
use crate::core::traits::DestinationHandler;
use crate::error::Result;
use crate::state::RawMetaColumnState;

/// Adds the `_airbyte_meta` column to an existing raw table.
///
/// Only the raw table layout changes; the final table is untouched, so no
/// soft reset is requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMetaColumnMigration;

#[async_trait]
impl<S: RawMetaColumnState> Migration<S> for RawMetaColumnMigration {
    fn name(&self) -> &str {
        "raw_meta_column"
    }

    fn require_migration(&self, state: &S) -> bool {
        state.raw_meta_column_added() != Some(true)
    }

    async fn migrate_if_necessary(
        &self,
        destination: &dyn DestinationHandler<S>,
        state: &S,
        stream: &StreamConfig,
    ) -> Result<MigrationResult<S>> {
        let id = &stream.id;
        let Some(raw) = destination
            .describe_table(&id.raw_namespace, &id.raw_name)
            .await?
        else {
            // A raw table created later gets the column from its DDL.
            return Ok(MigrationResult::noop(state.clone()));
        };

        if !raw.has_column(COLUMN_META) {
            info!("Adding {} to raw table of {}", COLUMN_META, id);
            destination
                .execute(&destination.generator().migrate_raw_add_meta_column(id))
                .await?;
        }

        Ok(MigrationResult::new(
            state.with_raw_meta_column_added(true),
            false,
        ))
    }
}
