use super::DestinationStore;
use crate::config::{validate_table_name, MAX_CHUNK_SIZE};
use crate::error::{ConfigError, StoreError};
use crate::model::{NormalizedRecord, ReplaceScope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

/// Postgres destination table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    table: String,
}

impl PgStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, ConfigError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub async fn connect(db_url: &str, table: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        Ok(Self::new(pool, table)?)
    }

    /// Create the destination table and its lookup index if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                year INTEGER NOT NULL,
                region_name TEXT NOT NULL,
                commodity TEXT NOT NULL,
                metric TEXT NOT NULL,
                unit TEXT NOT NULL,
                raw_value DOUBLE PRECISION,
                derived_value_per_ton DOUBLE PRECISION
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_slice_idx ON {table} (commodity, region_name, year)",
            table = self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Database server time, used as a connectivity check.
    pub async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let (now,): (DateTime<Utc>,) = sqlx::query_as("SELECT NOW()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn delete(&self, scope: &ReplaceScope) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = match scope {
            ReplaceScope::Everything => {
                sqlx::query(&format!("DELETE FROM {}", self.table))
                    .execute(&mut *tx)
                    .await?
            }
            ReplaceScope::Subset { commodity, region } => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE commodity = $1 AND region_name = $2",
                    self.table
                ))
                .bind(commodity)
                .bind(region)
                .execute(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn append(&self, rows: &[NormalizedRecord]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        // One transaction per append, split so no statement exceeds the
        // bind parameter limit.
        let mut tx = self.pool.begin().await?;
        for part in rows.chunks(MAX_CHUNK_SIZE) {
            insert_statement(&self.table, part)
                .build()
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn insert_statement<'a>(table: &str, rows: &'a [NormalizedRecord]) -> QueryBuilder<'a, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} (year, region_name, commodity, metric, unit, raw_value, derived_value_per_ton) ",
        table
    ));
    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.year)
            .push_bind(&row.region_name)
            .push_bind(&row.commodity)
            .push_bind(row.metric.as_str())
            .push_bind(&row.unit)
            .push_bind(row.raw_value)
            .push_bind(row.derived_value_per_ton);
    });
    builder
}
