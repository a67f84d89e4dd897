use async_trait::async_trait;
use sqlx::PgPool;

use crate::inbox::{ClaimedWork, ExactlyOnce, ReceiveOutcome};
use crate::outbox::DEFAULT_SCHEMA;

/// Postgres-backed duplicate gate.
///
/// The claim insert and the handler continuation share one transaction;
/// a primary-key conflict short-circuits before the handler runs.
#[derive(Clone)]
pub struct SqlxInbox {
    pool: PgPool,
    schema: String,
}

impl SqlxInbox {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: DEFAULT_SCHEMA.to_owned(),
        }
    }

    /// Use a schema other than the default.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

#[async_trait]
impl ExactlyOnce for SqlxInbox {
    #[tracing::instrument(skip(self, work))]
    async fn process_exactly_once(
        &self,
        message_id: &str,
        consumer_id: &str,
        work: Box<dyn FnOnce() -> ClaimedWork + Send>,
    ) -> Result<ReceiveOutcome, tower::BoxError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO {}.received_messages (message_id, consumer_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
            self.schema
        );
        let inserted = sqlx::query(&sql)
            .bind(message_id)
            .bind(consumer_id)
            .execute(&mut *tx)
            .await?;

        if inserted.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(ReceiveOutcome::Duplicate);
        }

        match work().await {
            Ok(()) => {
                tx.commit().await?;
                Ok(ReceiveOutcome::Handled)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }
}

/// Ensure the `received_messages` table exists.
pub async fn create_received_messages_table(
    pool: &PgPool,
    schema: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.received_messages (
            message_id    VARCHAR NOT NULL,
            consumer_id   VARCHAR NOT NULL,
            creation_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (message_id, consumer_id)
        )"
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Admin helper: delete every claim.
pub async fn purge_received_messages(pool: &PgPool, schema: &str) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(&format!("DELETE FROM {schema}.received_messages"))
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}
