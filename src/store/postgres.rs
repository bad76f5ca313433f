use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, Connection, Pool, Postgres, Row};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{BackingStore, KeyResult, Query, Record, RecordKey, SortOrder, StoreError};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name
pub const SCHEMA: &str = "confsync";

/// Durable store: every record kind lives in one table keyed by
/// `(kind, parent, id)` with an index on `(kind, parent, ts)` for listings.
pub struct PostgresStore {
    pool: DbPool,
}

impl PostgresStore {
    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Connects and initializes the schema, retrying with exponential backoff
    /// to survive DNS/startup races.
    pub async fn connect(database_url: &str, max_connections: u32, max_attempts: u32) -> anyhow::Result<Self> {
        // Force UTF-8 client encoding to avoid sqlx issues with non-ASCII server messages
        std::env::set_var("PGCLIENTENCODING", "UTF8");

        let max_attempts = max_attempts.max(1);
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=max_attempts {
            match PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(5))
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    log::info!(
                        "✅ Connected to database (attempt {}/{}).",
                        attempt,
                        max_attempts
                    );
                    match initialize_database(&pool).await {
                        Ok(()) => return Ok(Self { pool }),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(e) => {
                    last_err = Some(e.into());
                }
            }
            if attempt == max_attempts {
                break;
            }
            // Backoff with cap
            let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms, 800ms, ... capped at ~12.8s
            log::warn!(
                "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
                attempt,
                max_attempts,
                delay_ms
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
    }
}

pub async fn initialize_database(pool: &DbPool) -> anyhow::Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x434F4E4653594E43; // "CONFSYNC" in hex

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    log::info!("Acquiring database migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.records (
            kind TEXT NOT NULL,
            parent TEXT NOT NULL,
            id TEXT NOT NULL,
            ts TIMESTAMPTZ NOT NULL,
            data BYTEA NOT NULL,
            PRIMARY KEY (kind, parent, id)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_records_kind_parent_ts
         ON {}.records(kind, parent, ts)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;
    log::info!("Database initialization complete, transaction committed.");

    Ok(())
}

/// Lower bound of a listing; binds `$3` (and `$4` for the id tiebreak).
fn after_clause(query: &Query) -> &'static str {
    match (&query.after, &query.after_id) {
        (Some(_), Some(_)) => " AND (ts, id) > ($3, $4)",
        (Some(_), None) => " AND ts > $3",
        (None, _) => "",
    }
}

fn row_to_record(row: &PgRow) -> Result<Record, sqlx::Error> {
    Ok(Record {
        key: RecordKey {
            kind: row.try_get("kind")?,
            parent: row.try_get("parent")?,
            id: row.try_get("id")?,
        },
        timestamp: row.try_get::<DateTime<Utc>, _>("ts")?,
        data: row.try_get("data")?,
    })
}

#[async_trait]
impl BackingStore for PostgresStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {}.records (kind, parent, id, ts, data) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (kind, parent, id) DO UPDATE SET ts = EXCLUDED.ts, data = EXCLUDED.data",
            SCHEMA
        ))
        .bind(&record.key.kind)
        .bind(&record.key.parent)
        .bind(&record.key.id)
        .bind(record.timestamp)
        .bind(&record.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT kind, parent, id, ts, data FROM {}.records
             WHERE kind = $1 AND parent = $2 AND id = $3",
            SCHEMA
        ))
        .bind(&key.kind)
        .bind(&key.parent)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_record).transpose()?)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let mut sql = format!(
            "SELECT kind, parent, id, ts, data FROM {}.records WHERE kind = $1 AND parent = $2",
            SCHEMA
        );
        sql.push_str(after_clause(query));
        match query.order {
            SortOrder::Ascending => sql.push_str(" ORDER BY ts ASC, id ASC"),
            SortOrder::Descending => sql.push_str(" ORDER BY ts DESC, id DESC"),
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut q = sqlx::query(&sql).bind(&query.kind).bind(&query.parent);
        if let Some(after) = query.after {
            q = q.bind(after);
            if let Some(after_id) = &query.after_id {
                q = q.bind(after_id);
            }
        }
        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_multi(&self, keys: &[RecordKey]) -> Result<Vec<KeyResult<Option<Record>>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let kinds: Vec<String> = keys.iter().map(|k| k.kind.clone()).collect();
        let parents: Vec<String> = keys.iter().map(|k| k.parent.clone()).collect();
        let ids: Vec<String> = keys.iter().map(|k| k.id.clone()).collect();

        let rows = sqlx::query(&format!(
            "SELECT r.kind, r.parent, r.id, r.ts, r.data FROM {}.records r
             JOIN UNNEST($1::text[], $2::text[], $3::text[]) AS k(kind, parent, id)
               ON r.kind = k.kind AND r.parent = k.parent AND r.id = k.id",
            SCHEMA
        ))
        .bind(&kinds)
        .bind(&parents)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut found: HashMap<RecordKey, Record> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            found.insert(record.key.clone(), record);
        }

        Ok(keys.iter().map(|key| Ok(found.get(key).cloned())).collect())
    }

    async fn create_multi(&self, records: Vec<Record>) -> Result<Vec<KeyResult<()>>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let kinds: Vec<String> = records.iter().map(|r| r.key.kind.clone()).collect();
        let parents: Vec<String> = records.iter().map(|r| r.key.parent.clone()).collect();
        let ids: Vec<String> = records.iter().map(|r| r.key.id.clone()).collect();
        let timestamps: Vec<DateTime<Utc>> = records.iter().map(|r| r.timestamp).collect();
        let data: Vec<Vec<u8>> = records.iter().map(|r| r.data.clone()).collect();

        let rows = sqlx::query(&format!(
            "INSERT INTO {}.records (kind, parent, id, ts, data)
             SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::timestamptz[], $5::bytea[])
             ON CONFLICT (kind, parent, id) DO NOTHING
             RETURNING kind, parent, id",
            SCHEMA
        ))
        .bind(&kinds)
        .bind(&parents)
        .bind(&ids)
        .bind(&timestamps)
        .bind(&data)
        .fetch_all(&self.pool)
        .await?;

        let mut inserted: HashSet<RecordKey> = HashSet::with_capacity(rows.len());
        for row in &rows {
            inserted.insert(RecordKey {
                kind: row.try_get("kind")?,
                parent: row.try_get("parent")?,
                id: row.try_get("id")?,
            });
        }

        Ok(records
            .iter()
            .map(|record| {
                if inserted.contains(&record.key) {
                    Ok(())
                } else {
                    Err(StoreError::AlreadyExists(record.key.id.clone()))
                }
            })
            .collect())
    }

    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError> {
        let mut sql = format!("DELETE FROM {}.records WHERE kind = $1 AND parent = $2", SCHEMA);
        sql.push_str(after_clause(query));

        let mut q = sqlx::query(&sql).bind(&query.kind).bind(&query.parent);
        if let Some(after) = query.after {
            q = q.bind(after);
            if let Some(after_id) = &query.after_id {
                q = q.bind(after_id);
            }
        }
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
