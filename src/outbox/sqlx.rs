use async_trait::async_trait;
use sqlx::PgPool;

use crate::outbox::{DEFAULT_SCHEMA, InsertRecord, OutboxRecord};

/// Postgres-backed outbox driver.
///
/// Inserts enlist in the caller's `sqlx` transaction, so the outbox row
/// commits atomically with the business write.
#[derive(Clone)]
pub struct SqlxOutbox {
    schema: String,
}

impl Default for SqlxOutbox {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_owned(),
        }
    }
}

impl SqlxOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a schema other than the default.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

#[async_trait]
impl InsertRecord for SqlxOutbox {
    type Error = sqlx::Error;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(id = %record.id, destination = %record.destination))]
    async fn insert_record(
        &self,
        record: OutboxRecord,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        let sql = format!(
            "INSERT INTO {}.message (id, destination, headers, payload, published) \
             VALUES ($1, $2, $3, $4, $5)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.destination)
            .bind(&record.headers)
            .bind(&record.payload)
            .bind(record.published)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Ensure the `message` table exists.
pub async fn create_message_table(pool: &PgPool, schema: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.message (
            id            VARCHAR PRIMARY KEY,
            destination   VARCHAR NOT NULL,
            headers       TEXT NOT NULL,
            payload       TEXT NOT NULL,
            creation_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            published     SMALLINT NOT NULL DEFAULT 0
        )"
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Admin helper: delete every outbox row.
pub async fn purge_messages(pool: &PgPool, schema: &str) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(&format!("DELETE FROM {schema}.message"))
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}
