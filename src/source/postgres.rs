//! PostgreSQL extractor backed by a `deadpool-postgres` pool.
//!
//! Each extraction checks out one connection, opens a read-only transaction
//! and declares a server-side cursor over `SELECT to_jsonb(t) FROM (<query>) t`.
//! Rows are fetched `fetch_size` at a time, only when the consumer asks for
//! more, so a table is never buffered in full.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::emit;
use crate::error::{
    AcquireSnafu, ConnectionStringSnafu, PoolBuildSnafu, QuerySnafu, ReleasedSnafu,
    RowShapeSnafu, SourceError,
};
use crate::metrics::events::ActiveConnections;

use super::{ExtractionHandle, Extractor, ReleaseHandle, Row};

const CURSOR_NAME: &str = "snowdrift_cursor";

type SharedClient = Arc<Mutex<Option<Object>>>;

/// Extractor over a shared PostgreSQL connection pool.
pub struct PostgresExtractor {
    pool: Pool,
    fetch_size: usize,
}

impl PostgresExtractor {
    /// Build the pool. No connection is opened until the first extraction.
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let pg_config: tokio_postgres::Config =
            config.url.parse().context(ConnectionStringSnafu)?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .context(PoolBuildSnafu)?;

        Ok(Self {
            pool,
            fetch_size: config.fetch_size,
        })
    }
}

fn report_connections(pool: &Pool) {
    let status = pool.status();
    emit!(ActiveConnections {
        count: status.size.saturating_sub(status.available),
    });
}

#[async_trait]
impl Extractor for PostgresExtractor {
    async fn extract(&self, table: &str, query: &str) -> Result<ExtractionHandle, SourceError> {
        let client = self.pool.get().await.context(AcquireSnafu { table })?;
        report_connections(&self.pool);

        if let Err(source) = client.batch_execute(&open_cursor_sql(query)).await {
            rollback(client, table).await;
            report_connections(&self.pool);
            return Err(source).context(QuerySnafu { table });
        }
        debug!(table = %table, fetch_size = self.fetch_size, "Opened cursor");

        let shared: SharedClient = Arc::new(Mutex::new(Some(client)));
        let stream = row_stream(shared.clone(), table.to_string(), self.fetch_size);

        let pool = self.pool.clone();
        let table = table.to_string();
        let release = ReleaseHandle::new(move || async move {
            let client = shared.lock().await.take();
            if let Some(client) = client {
                rollback(client, &table).await;
            }
            report_connections(&pool);
            debug!(table = %table, "Released connection");
        });

        Ok(ExtractionHandle::new(stream, release))
    }

    async fn close(&self) {
        // Only idle connections are removed; the pool stays usable for the next run.
        let result = self.pool.retain(|_, _| false);
        debug!(closed = result.removed.len(), "Closed idle source connections");
        report_connections(&self.pool);
    }
}

/// End the transaction and hand the connection back to the pool. A
/// connection that cannot roll back is detached so it is never reused.
async fn rollback(client: Object, table: &str) {
    if let Err(e) = client.batch_execute("ROLLBACK").await {
        warn!(table = %table, error = %e, "Rollback failed, discarding connection");
        drop(Object::take(client));
    }
}

struct Cursor {
    client: SharedClient,
    table: String,
    fetch_sql: String,
    fetch_size: usize,
    exhausted: bool,
}

fn row_stream(client: SharedClient, table: String, fetch_size: usize) -> super::RowStream {
    let cursor = Cursor {
        client,
        table,
        fetch_sql: format!("FETCH {fetch_size} FROM {CURSOR_NAME}"),
        fetch_size,
        exhausted: false,
    };

    stream::try_unfold(cursor, |mut cursor| async move {
        if cursor.exhausted {
            return Ok(None);
        }

        let rows = {
            let guard = cursor.client.lock().await;
            let Some(client) = guard.as_ref() else {
                return ReleasedSnafu {
                    table: cursor.table.clone(),
                }
                .fail();
            };
            client
                .query(cursor.fetch_sql.as_str(), &[])
                .await
                .context(QuerySnafu {
                    table: cursor.table.as_str(),
                })?
        };

        if rows.is_empty() {
            return Ok(None);
        }
        cursor.exhausted = rows.len() < cursor.fetch_size;

        let batch = rows
            .iter()
            .map(|row| {
                let value: Value = row.try_get(0).context(QuerySnafu {
                    table: cursor.table.as_str(),
                })?;
                to_record(&cursor.table, value)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some((batch, cursor)))
    })
    .map_ok(|batch| stream::iter(batch.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

fn open_cursor_sql(query: &str) -> String {
    let query = query.trim().trim_end_matches(';').trim_end();
    format!(
        "BEGIN READ ONLY; DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR SELECT to_jsonb(t) FROM ({query}) AS t"
    )
}

fn to_record(table: &str, value: Value) -> Result<Row, SourceError> {
    match value {
        Value::Object(row) => Ok(row),
        other => RowShapeSnafu {
            table,
            message: format!("expected a JSON object, got {other}"),
        }
        .fail(),
    }
}
