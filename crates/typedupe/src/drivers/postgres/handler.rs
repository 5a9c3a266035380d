//! PostgreSQL destination handler.
//!
//! Uses deadpool-postgres for connection pooling. Final-table shapes come from
//! `information_schema.columns`; state blobs are stored as `jsonb` in
//! `{raw_namespace}._airbyte_destination_state`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::dialect::PostgresDialect;
use super::tls::{make_connector, SslMode};
use crate::config::DestinationConfig;
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

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const STATE_TABLE: &str = "_airbyte_destination_state";

/// Destination handler over a PostgreSQL connection pool.
pub struct PostgresDestinationHandler {
    pool: Pool,
    generator: SqlGenerator,
    raw_namespace: String,
}

impl PostgresDestinationHandler {
    /// Connect to the configured database and verify the connection.
    pub async fn connect(
        config: &DestinationConfig,
        raw_namespace: &str,
        max_conns: usize,
    ) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode: SslMode = config.ssl_mode.parse()?;
        let pool = match make_connector(ssl_mode)? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| TypeDedupeError::pool(e.to_string(), "creating PostgreSQL pool"))?
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| TypeDedupeError::pool(e.to_string(), "creating PostgreSQL pool"))?
            }
        };

        let handler = Self::from_pool(pool, raw_namespace);
        handler.client("testing PostgreSQL connection").await?
            .simple_query("SELECT 1")
            .await?;

        info!(
            "Connected to PostgreSQL destination: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(handler)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Pool, raw_namespace: &str) -> Self {
        Self {
            pool,
            generator: SqlGenerator::new(DialectImpl::Postgres(PostgresDialect::new())),
            raw_namespace: raw_namespace.to_string(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| TypeDedupeError::pool(e.to_string(), context))
    }

    /// Append records to a stream's raw table in one transaction.
    pub async fn insert_raw_records(&self, id: &StreamId, records: &[RawRecord]) -> Result<()> {
        let d = self.generator.dialect();
        let sql = format!(
            "INSERT INTO {} ({}, {}, {}) VALUES ($1, $2, $3)",
            self.generator.raw_table(id),
            d.quote_ident(COLUMN_RAW_ID),
            d.quote_ident(COLUMN_DATA),
            d.quote_ident(COLUMN_EXTRACTED_AT),
        );

        let mut client = self.client("inserting raw records").await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(&sql).await?;
        for record in records {
            tx.execute(&stmt, &[&record.raw_id, &record.data, &record.extracted_at])
                .await?;
        }
        tx.commit().await?;
        debug!("Inserted {} raw records into {}", records.len(), id.raw_name);
        Ok(())
    }

    fn state_table(&self) -> String {
        self.generator
            .dialect()
            .qualify(&self.raw_namespace, STATE_TABLE)
    }

    async fn ensure_state_table(&self, client: &Object) -> Result<()> {
        let d = self.generator.dialect();
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {};\nCREATE TABLE IF NOT EXISTS {} (\n  name varchar NOT NULL,\n  namespace varchar,\n  destination_state jsonb NOT NULL,\n  updated_at timestamp with time zone NOT NULL DEFAULT now()\n)",
                d.quote_ident(&self.raw_namespace),
                self.state_table()
            ))
            .await?;
        Ok(())
    }
}

fn statement_error(e: tokio_postgres::Error, statement: &str) -> TypeDedupeError {
    let preview: String = statement.chars().take(120).collect();
    TypeDedupeError::destination(e.to_string(), format!("executing `{}`", preview))
}

#[async_trait]
impl<S: DestinationState> StateHandler<S> for PostgresDestinationHandler {
    async fn get_states(&self) -> Result<HashMap<StreamDescriptor, S>> {
        let client = self.client("loading destination state").await?;
        self.ensure_state_table(&client).await?;

        let rows = client
            .query(
                &format!(
                    "SELECT name::text, namespace::text, destination_state FROM {}",
                    self.state_table()
                ),
                &[],
            )
            .await?;

        let mut states = HashMap::with_capacity(rows.len());
        for row in rows {
            let descriptor = StreamDescriptor {
                name: row.get(0),
                namespace: row.get(1),
            };
            let blob: serde_json::Value = row.get(2);
            match serde_json::from_value::<S>(blob) {
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
        let mut client = self.client("committing destination state").await?;
        self.ensure_state_table(&client).await?;
        let table = self.state_table();

        for (id, state) in states {
            let blob = serde_json::to_value(state)?;
            let tx = client.transaction().await?;
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE name = $1 AND namespace IS NOT DISTINCT FROM $2",
                    table
                ),
                &[&id.original_name, &id.original_namespace],
            )
            .await?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (name, namespace, destination_state, updated_at) VALUES ($1, $2, $3, now())",
                    table
                ),
                &[&id.original_name, &id.original_namespace, &blob],
            )
            .await?;
            tx.commit().await?;
            debug!("Committed destination state for {}", id);
        }
        Ok(())
    }
}

#[async_trait]
impl<S: DestinationState> DestinationHandler<S> for PostgresDestinationHandler {
    async fn execute(&self, sql: &Sql) -> Result<()> {
        let mut client = self.client("executing SQL").await?;
        for group in sql.transactions() {
            if let [statement] = group.as_slice() {
                client
                    .batch_execute(statement)
                    .await
                    .map_err(|e| statement_error(e, statement))?;
                continue;
            }
            let tx = client.transaction().await?;
            for statement in group {
                tx.batch_execute(statement)
                    .await
                    .map_err(|e| statement_error(e, statement))?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    fn generator(&self) -> &SqlGenerator {
        &self.generator
    }

    async fn describe_table(&self, namespace: &str, name: &str) -> Result<Option<ExistingTable>> {
        let client = self.client("describing table").await?;
        let rows = client
            .query(
                "SELECT column_name::text, data_type::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&namespace, &name],
            )
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExistingTable::new(
            rows.iter()
                .map(|row| ExistingColumn {
                    name: row.get(0),
                    data_type: row.get(1),
                })
                .collect(),
        )))
    }

    async fn query_count(&self, sql: &str) -> Result<i64> {
        let client = self.client("running count query").await?;
        let row = client.query_one(sql, &[]).await?;
        Ok(row.get(0))
    }

    async fn raw_table_watermark(&self, id: &StreamId) -> Result<RawTableWatermark> {
        let exists = DestinationHandler::<S>::describe_table(self, &id.raw_namespace, &id.raw_name)
            .await?
            .is_some();
        if !exists {
            return Ok(RawTableWatermark::default());
        }

        let client = self.client("reading raw table watermark").await?;
        let row = client
            .query_one(&self.generator.raw_watermark_query(id), &[])
            .await?;
        Ok(RawTableWatermark {
            raw_table_exists: true,
            earliest_unprocessed: row.get::<_, Option<DateTime<Utc>>>(0),
            latest_unprocessed: row.get::<_, Option<DateTime<Utc>>>(1),
            max_processed: row.get::<_, Option<DateTime<Utc>>>(2),
        })
    }

    fn destination_type(&self) -> &'static str {
        "postgres"
    }
}
