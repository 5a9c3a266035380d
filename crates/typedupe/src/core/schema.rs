//! Destination-side metadata: fixed column names, introspected tables,
//! raw-table watermarks and the per-stream initial state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::catalog::StreamConfig;

pub const COLUMN_RAW_ID: &str = "_airbyte_raw_id";
pub const COLUMN_EXTRACTED_AT: &str = "_airbyte_extracted_at";
pub const COLUMN_LOADED_AT: &str = "_airbyte_loaded_at";
pub const COLUMN_DATA: &str = "_airbyte_data";
pub const COLUMN_META: &str = "_airbyte_meta";

/// Source column carrying the CDC deletion marker.
pub const COLUMN_CDC_DELETED_AT: &str = "_ab_cdc_deleted_at";

/// Metadata columns of every final table, in DDL order.
pub const FINAL_TABLE_META_COLUMNS: [&str; 4] = [
    COLUMN_RAW_ID,
    COLUMN_EXTRACTED_AT,
    COLUMN_LOADED_AT,
    COLUMN_META,
];

/// One column of an introspected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingColumn {
    pub name: String,
    pub data_type: String,
}

/// Snapshot of a table as it currently exists in the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingTable {
    pub columns: Vec<ExistingColumn>,
}

impl ExistingTable {
    pub fn new(columns: Vec<ExistingColumn>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ExistingColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Extraction-timestamp range of raw rows relative to the final table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawTableWatermark {
    pub raw_table_exists: bool,
    /// Oldest raw row not yet typed into the final table.
    pub earliest_unprocessed: Option<DateTime<Utc>>,
    /// Newest raw row not yet typed into the final table.
    pub latest_unprocessed: Option<DateTime<Utc>>,
    /// Newest raw row already typed into the final table.
    pub max_processed: Option<DateTime<Utc>>,
}

impl RawTableWatermark {
    pub fn has_unprocessed_records(&self) -> bool {
        self.earliest_unprocessed.is_some()
    }

    /// Lower bound for the next incremental typing pass.
    ///
    /// One second before the oldest unprocessed row when there is one,
    /// otherwise the newest processed row. `None` means "scan everything".
    pub fn typing_lower_bound(&self) -> Option<DateTime<Utc>> {
        match self.earliest_unprocessed {
            Some(ts) => Some(ts - Duration::seconds(1)),
            None => self.max_processed,
        }
    }
}

/// One record as it lands in a raw table.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub raw_id: String,
    pub extracted_at: DateTime<Utc>,
    pub data: Value,
}

impl RawRecord {
    /// A record with a fresh random id.
    pub fn new(data: Value, extracted_at: DateTime<Utc>) -> Self {
        Self {
            raw_id: Uuid::new_v4().to_string(),
            extracted_at,
            data,
        }
    }
}

/// Everything the orchestrator needs to know about a stream at startup.
#[derive(Debug, Clone)]
pub struct DestinationInitialState<S> {
    pub stream: StreamConfig,
    pub is_final_table_present: bool,
    pub is_final_table_empty: bool,
    /// True when the final table exists but its shape differs from the
    /// expected shape, or when the dialect cannot tell.
    pub is_schema_mismatch: bool,
    pub raw_table: RawTableWatermark,
    pub destination_state: S,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_lower_bound_prefers_unprocessed() {
        let earliest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();
        let watermark = RawTableWatermark {
            raw_table_exists: true,
            earliest_unprocessed: Some(earliest),
            latest_unprocessed: Some(earliest),
            max_processed: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap()),
        };
        assert!(watermark.has_unprocessed_records());
        assert_eq!(
            watermark.typing_lower_bound(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 9).unwrap())
        );
    }

    #[test]
    fn test_lower_bound_falls_back_to_processed() {
        let processed = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();
        let watermark = RawTableWatermark {
            raw_table_exists: true,
            max_processed: Some(processed),
            ..Default::default()
        };
        assert!(!watermark.has_unprocessed_records());
        assert_eq!(watermark.typing_lower_bound(), Some(processed));
        assert_eq!(RawTableWatermark::default().typing_lower_bound(), None);
    }

    #[test]
    fn test_existing_table_lookup() {
        let table = ExistingTable::new(vec![ExistingColumn {
            name: "_airbyte_meta".into(),
            data_type: "jsonb".into(),
        }]);
        assert!(table.has_column("_AIRBYTE_META"));
        assert!(table.column("missing").is_none());
    }
}
