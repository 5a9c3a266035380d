//! Normalizes offset-bearing `_airbyte_extracted_at` values to UTC.

use async_trait::async_trait;
use tracing::info;

use super::{Migration, MigrationResult};
use crate::core::catalog::StreamConfig;
use crate::core::schema::COLUMN_EXTRACTED_AT;
use crate::core::traits::{DestinationHandler, Dialect};
use crate::error::Result;
use crate::state::ExtractedAtUtcState;

/// Rewrites raw extraction timestamps written with a non-UTC offset.
///
/// Ordering and incremental watermarks compare these values, so rows that
/// were rewritten invalidate the final table and a soft reset is requested.
/// Destinations storing native timezone-aware timestamps have nothing to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractedAtUtcMigration;

#[async_trait]
impl<S: ExtractedAtUtcState> Migration<S> for ExtractedAtUtcMigration {
    fn name(&self) -> &str {
        "extracted_at_utc"
    }

    fn require_migration(&self, state: &S) -> bool {
        state.extracted_at_utc_migrated() != Some(true)
    }

    async fn migrate_if_necessary(
        &self,
        destination: &dyn DestinationHandler<S>,
        state: &S,
        stream: &StreamConfig,
    ) -> Result<MigrationResult<S>> {
        let generator = destination.generator();
        let id = &stream.id;

        let column = generator.dialect().quote_ident(COLUMN_EXTRACTED_AT);
        if generator.dialect().utc_normalization(&column).is_none() {
            return Ok(MigrationResult::new(
                state.with_extracted_at_utc_migrated(true),
                false,
            ));
        }

        if destination
            .describe_table(&id.raw_namespace, &id.raw_name)
            .await?
            .is_none()
        {
            return Ok(MigrationResult::noop(state.clone()));
        }

        let pending = destination
            .query_count(&generator.count_non_utc_extracted_at(id)?)
            .await?;
        if pending == 0 {
            return Ok(MigrationResult::new(
                state.with_extracted_at_utc_migrated(true),
                false,
            ));
        }

        info!(
            "Normalizing {} non-UTC {} values in raw table of {}",
            pending, COLUMN_EXTRACTED_AT, id
        );
        destination
            .execute(&generator.normalize_extracted_at_to_utc(id)?)
            .await?;

        Ok(MigrationResult::new(
            state.with_extracted_at_utc_migrated(true),
            true,
        ))
    }
}
