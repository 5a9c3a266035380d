//! Per-stream destination state.
//!
//! The orchestrator treats the state blob as opaque: it is loaded through a
//! [`StateHandler`](crate::core::StateHandler), threaded through the
//! migrations of a stream and written back once the whole sequence succeeds.
//! The blob is stored as JSON, so every field of a concrete state is optional
//! and absent fields mean "unknown".

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bound satisfied by every destination state blob.
pub trait DestinationState:
    Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> DestinationState for T where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Default state blob: which raw-table migrations have been applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingDedupingState {
    /// `_airbyte_meta` has been added to the raw table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_meta_column_added: Option<bool>,

    /// `_airbyte_extracted_at` values have been normalized to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at_utc_migrated: Option<bool>,
}

/// State that records whether the raw-table meta column exists.
pub trait RawMetaColumnState: DestinationState {
    fn raw_meta_column_added(&self) -> Option<bool>;
    fn with_raw_meta_column_added(&self, added: bool) -> Self;
}

/// State that records whether extraction timestamps are normalized to UTC.
pub trait ExtractedAtUtcState: DestinationState {
    fn extracted_at_utc_migrated(&self) -> Option<bool>;
    fn with_extracted_at_utc_migrated(&self, migrated: bool) -> Self;
}

impl RawMetaColumnState for TypingDedupingState {
    fn raw_meta_column_added(&self) -> Option<bool> {
        self.raw_meta_column_added
    }

    fn with_raw_meta_column_added(&self, added: bool) -> Self {
        Self {
            raw_meta_column_added: Some(added),
            ..self.clone()
        }
    }
}

impl ExtractedAtUtcState for TypingDedupingState {
    fn extracted_at_utc_migrated(&self) -> Option<bool> {
        self.extracted_at_utc_migrated
    }

    fn with_extracted_at_utc_migrated(&self, migrated: bool) -> Self {
        Self {
            extracted_at_utc_migrated: Some(migrated),
            ..self.clone()
        }
    }
}
