//! SQLite destination handler.
//!
//! Wraps a single `rusqlite` connection behind a mutex. The async trait
//! methods run their SQL on tokio's blocking pool, so a long typing pass
//! never stalls a runtime worker. The synchronous helpers (`create_raw_table`,
//! `insert_raw_records`, `query_strings`) are for loaders and tests and lock
//! the connection on the calling thread.
//!
//! State blobs live in `main._airbyte_destination_state` as JSON text, one
//! row per stream.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::dialect::{format_timestamp, SqliteDialect, SQLITE_MAIN_SCHEMA};
use crate::core::identifier::{StreamDescriptor, StreamId};
use crate::core::schema::{
    ExistingColumn, ExistingTable, RawRecord, RawTableWatermark, COLUMN_DATA,
    COLUMN_EXTRACTED_AT, COLUMN_RAW_ID,
};
use crate::core::sql::Sql;
use crate::core::traits::{DestinationHandler, Dialect, StateHandler};
use crate::drivers::DialectImpl;
use crate::error::{Result, TypeDedupeError};
use crate::generator::SqlGenerator;
use crate::state::DestinationState;

const STATE_TABLE: &str = "_airbyte_destination_state";

type WatermarkRow = (Option<String>, Option<String>, Option<String>);

/// Destination handler over one SQLite database.
pub struct SqliteDestinationHandler {
    conn: Arc<Mutex<Connection>>,
    generator: SqlGenerator,
}

impl SqliteDestinationHandler {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        debug!("Opened SQLite destination at {}", path.display());
        Ok(Self::with_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?))
    }

    pub fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            generator: SqlGenerator::new(DialectImpl::Sqlite(SqliteDialect::new())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_connection(&conn)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| TypeDedupeError::TaskPanicked(format!("sqlite worker: {}", e)))?
    }

    /// Create the raw table of a stream if it does not exist.
    pub fn create_raw_table(&self, id: &StreamId) -> Result<()> {
        self.execute_blocking(&self.generator.create_raw_table(id)?)
    }

    /// Append records to a stream's raw table in one transaction.
    pub fn insert_raw_records(&self, id: &StreamId, records: &[RawRecord]) -> Result<()> {
        let d = self.generator.dialect();
        let sql = format!(
            "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, ?3)",
            self.generator.raw_table(id),
            d.quote_ident(COLUMN_RAW_ID),
            d.quote_ident(COLUMN_DATA),
            d.quote_ident(COLUMN_EXTRACTED_AT),
        );

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for record in records {
                stmt.execute(params![
                    record.raw_id,
                    serde_json::to_string(&record.data)?,
                    format_timestamp(&record.extracted_at),
                ])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} raw records into {}", records.len(), id.raw_name);
        Ok(())
    }

    /// Run a query returning rows of text columns; test and CLI helper.
    pub fn query_strings(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let width = stmt.column_count();
        let rows = stmt.query_map([], |row| {
            (0..width)
                .map(|i| {
                    let value: rusqlite::types::Value = row.get(i)?;
                    Ok(match value {
                        rusqlite::types::Value::Null => None,
                        rusqlite::types::Value::Integer(n) => Some(n.to_string()),
                        rusqlite::types::Value::Real(f) => Some(f.to_string()),
                        rusqlite::types::Value::Text(s) => Some(s),
                        rusqlite::types::Value::Blob(b) => {
                            Some(String::from_utf8_lossy(&b).into_owned())
                        }
                    })
                })
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn execute_blocking(&self, sql: &Sql) -> Result<()> {
        run_batches(&mut *self.lock()?, sql)
    }

    fn state_table(&self) -> String {
        self.generator.dialect().qualify(SQLITE_MAIN_SCHEMA, STATE_TABLE)
    }
}

fn lock_connection(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| TypeDedupeError::destination("connection mutex poisoned", "sqlite"))
}

fn run_batches(conn: &mut Connection, sql: &Sql) -> Result<()> {
    for group in sql.transactions() {
        if let [statement] = group.as_slice() {
            conn.execute_batch(statement)
                .map_err(|e| statement_error(e, statement))?;
            continue;
        }
        let tx = conn.transaction()?;
        for statement in group {
            tx.execute_batch(statement)
                .map_err(|e| statement_error(e, statement))?;
        }
        tx.commit()?;
    }
    Ok(())
}

fn describe(conn: &Connection, namespace: &str, name: &str) -> Result<Option<ExistingTable>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1, ?2) ORDER BY cid")?;
    let columns = stmt
        .query_map(params![name, namespace], |row| {
            Ok(ExistingColumn {
                name: row.get(0)?,
                data_type: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if columns.is_empty() {
        Ok(None)
    } else {
        Ok(Some(ExistingTable::new(columns)))
    }
}

fn ensure_state_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  name TEXT NOT NULL,\n  namespace TEXT,\n  destination_state TEXT NOT NULL,\n  updated_at TEXT NOT NULL\n)",
        table
    ))?;
    Ok(())
}

fn statement_error(e: rusqlite::Error, statement: &str) -> TypeDedupeError {
    let preview: String = statement.chars().take(120).collect();
    TypeDedupeError::destination(e.to_string(), format!("executing `{}`", preview))
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| {
                    TypeDedupeError::destination(
                        format!("invalid timestamp '{}': {}", s, e),
                        "reading raw table watermark",
                    )
                })
        })
        .transpose()
}

#[async_trait]
impl<S: DestinationState> StateHandler<S> for SqliteDestinationHandler {
    async fn get_states(&self) -> Result<HashMap<StreamDescriptor, S>> {
        let table = self.state_table();
        let rows = self
            .with_conn(move |conn| {
                ensure_state_table(conn, &table)?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT name, namespace, destination_state FROM {}",
                    table
                ))?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut states = HashMap::with_capacity(rows.len());
        for (name, namespace, blob) in rows {
            let descriptor = StreamDescriptor { namespace, name };
            match serde_json::from_str::<S>(&blob) {
                Ok(state) => {
                    states.insert(descriptor, state);
                }
                Err(e) => warn!(
                    "Ignoring unreadable destination state for {}: {}",
                    descriptor, e
                ),
            }
        }
        Ok(states)
    }

    async fn commit_states(&self, states: &HashMap<StreamId, S>) -> Result<()> {
        let table = self.state_table();
        let now = format_timestamp(&Utc::now());
        let blobs = states
            .iter()
            .map(|(id, state)| {
                Ok((
                    id.original_name.clone(),
                    id.original_namespace.clone(),
                    serde_json::to_string(state)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        self.with_conn(move |conn| {
            ensure_state_table(conn, &table)?;
            for (name, namespace, blob) in &blobs {
                let tx = conn.transaction()?;
                tx.execute(
                    &format!("DELETE FROM {} WHERE name = ?1 AND namespace IS ?2", table),
                    params![name, namespace],
                )?;
                tx.execute(
                    &format!(
                        "INSERT INTO {} (name, namespace, destination_state, updated_at) VALUES (?1, ?2, ?3, ?4)",
                        table
                    ),
                    params![name, namespace, blob, now],
                )?;
                tx.commit()?;
            }
            Ok(())
        })
        .await?;

        for id in states.keys() {
            debug!("Committed destination state for {}", id);
        }
        Ok(())
    }
}

#[async_trait]
impl<S: DestinationState> DestinationHandler<S> for SqliteDestinationHandler {
    async fn execute(&self, sql: &Sql) -> Result<()> {
        let sql = sql.clone();
        self.with_conn(move |conn| run_batches(conn, &sql)).await
    }

    fn generator(&self) -> &SqlGenerator {
        &self.generator
    }

    async fn describe_table(&self, namespace: &str, name: &str) -> Result<Option<ExistingTable>> {
        let (namespace, name) = (namespace.to_string(), name.to_string());
        self.with_conn(move |conn| describe(conn, &namespace, &name))
            .await
    }

    async fn query_count(&self, sql: &str) -> Result<i64> {
        let sql = sql.to_string();
        self.with_conn(move |conn| Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?))
            .await
    }

    async fn raw_table_watermark(&self, id: &StreamId) -> Result<RawTableWatermark> {
        let query = self.generator.raw_watermark_query(id);
        let (namespace, name) = (id.raw_namespace.clone(), id.raw_name.clone());
        let row: Option<WatermarkRow> = self
            .with_conn(move |conn| {
                if describe(conn, &namespace, &name)?.is_none() {
                    return Ok(None);
                }
                let row = conn.query_row(&query, [], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?;
                Ok(Some(row))
            })
            .await?;

        let Some((earliest, latest, processed)) = row else {
            return Ok(RawTableWatermark::default());
        };
        Ok(RawTableWatermark {
            raw_table_exists: true,
            earliest_unprocessed: parse_timestamp(earliest)?,
            latest_unprocessed: parse_timestamp(latest)?,
            max_processed: parse_timestamp(processed)?,
        })
    }

    fn destination_type(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TypingDedupingState;
    use chrono::TimeZone;
    use serde_json::json;

    fn stream_id(name: &str) -> StreamId {
        SqliteDialect::new().build_stream_id(Some("public"), name, "public", "airbyte_internal")
    }

    #[tokio::test]
    async fn test_execute_runs_groups_in_order() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let sql = Sql::concat([
            Sql::of("CREATE TABLE t (x INTEGER)"),
            Sql::transactionally(["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"]),
        ]);
        DestinationHandler::<TypingDedupingState>::execute(&handler, &sql)
            .await
            .unwrap();
        let count =
            DestinationHandler::<TypingDedupingState>::query_count(&handler, "SELECT COUNT(*) FROM t")
                .await
                .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_failed_group_rolls_back() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        handler
            .execute_blocking(&Sql::of("CREATE TABLE t (x INTEGER NOT NULL)"))
            .unwrap();
        let err = handler
            .execute_blocking(&Sql::transactionally([
                "INSERT INTO t VALUES (1)",
                "INSERT INTO t VALUES (NULL)",
            ]))
            .unwrap_err();
        assert!(matches!(err, TypeDedupeError::Destination { .. }));
        let rows = handler.query_strings("SELECT COUNT(*) FROM t").unwrap();
        assert_eq!(rows[0][0].as_deref(), Some("0"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_does_not_block_runtime_workers() {
        let handler = Arc::new(SqliteDestinationHandler::open_in_memory().unwrap());
        handler
            .execute_blocking(&Sql::of("CREATE TABLE t (x INTEGER)"))
            .unwrap();

        // Hold the connection so the async call has to wait on the mutex.
        let guard = handler.lock().unwrap();
        let pending = {
            let handler = handler.clone();
            tokio::spawn(async move {
                DestinationHandler::<TypingDedupingState>::execute(
                    handler.as_ref(),
                    &Sql::of("INSERT INTO t VALUES (1)"),
                )
                .await
            })
        };

        // Both runtime workers stay free while the insert waits.
        let ticks = tokio::spawn(async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            "ran"
        });
        assert_eq!(
            tokio::time::timeout(std::time::Duration::from_secs(5), ticks)
                .await
                .unwrap()
                .unwrap(),
            "ran"
        );
        assert!(!pending.is_finished());

        drop(guard);
        pending.await.unwrap().unwrap();
        let rows = handler.query_strings("SELECT COUNT(*) FROM t").unwrap();
        assert_eq!(rows[0][0].as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_describe_missing_table() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let table = DestinationHandler::<TypingDedupingState>::describe_table(
            &handler, "main", "nope",
        )
        .await
        .unwrap();
        assert!(table.is_none());
    }

    #[tokio::test]
    async fn test_raw_watermark() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let id = stream_id("users");

        let absent = DestinationHandler::<TypingDedupingState>::raw_table_watermark(&handler, &id)
            .await
            .unwrap();
        assert!(!absent.raw_table_exists);

        handler.create_raw_table(&id).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 2).unwrap();
        handler
            .insert_raw_records(
                &id,
                &[RawRecord::new(json!({"id": 1}), t1), RawRecord::new(json!({"id": 2}), t2)],
            )
            .unwrap();

        let watermark =
            DestinationHandler::<TypingDedupingState>::raw_table_watermark(&handler, &id)
                .await
                .unwrap();
        assert!(watermark.raw_table_exists);
        assert_eq!(watermark.earliest_unprocessed, Some(t1));
        assert_eq!(watermark.latest_unprocessed, Some(t2));
        assert_eq!(watermark.max_processed, None);
    }

    #[tokio::test]
    async fn test_state_roundtrip_per_stream() {
        let handler = SqliteDestinationHandler::open_in_memory().unwrap();
        let users = stream_id("users");
        let orders = stream_id("orders");

        let mut states = HashMap::new();
        states.insert(
            users.clone(),
            TypingDedupingState {
                raw_meta_column_added: Some(true),
                ..Default::default()
            },
        );
        states.insert(orders.clone(), TypingDedupingState::default());
        handler.commit_states(&states).await.unwrap();

        // Replacing one stream leaves the other untouched.
        let mut update = HashMap::new();
        update.insert(
            orders.clone(),
            TypingDedupingState {
                extracted_at_utc_migrated: Some(true),
                ..Default::default()
            },
        );
        handler.commit_states(&update).await.unwrap();

        let loaded: HashMap<StreamDescriptor, TypingDedupingState> =
            handler.get_states().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&users.descriptor()].raw_meta_column_added, Some(true));
        assert_eq!(
            loaded[&orders.descriptor()].extracted_at_utc_migrated,
            Some(true)
        );
    }
}
