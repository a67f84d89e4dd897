//! Outbox store abstractions and backend drivers.
//!
//! This module implements the storage half of the *transactional outbox
//! pattern*: outbound messages are written as rows in the same database
//! transaction as the business state change that produced them. An
//! external change-data-capture relay moves committed rows to the broker,
//! so the outbox is responsible for **atomicity and ordering**, never for
//! delivery.
//!
//! ## Components
//!
//! - [`OutboxRecord`]: the serialized row shape
//! - [`InsertRecord`]: trait for inserting rows inside the caller's
//!   transaction
//!
//! Concrete backends live in [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "postgres")]
pub mod sqlx;

/// Default database schema name for the messaging tables.
pub const DEFAULT_SCHEMA: &str = "eventuate";

/// A row of the `message` table.
///
/// `headers` is the JSON-serialized header map; `published` starts at 0
/// and is flipped to 1 by the relay once the row reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: String,
    pub destination: String,
    pub headers: String,
    pub payload: String,
    pub published: i16,
}

impl OutboxRecord {
    /// Create an unpublished record.
    pub fn new(
        id: impl Into<String>,
        destination: impl Into<String>,
        headers: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            headers: headers.into(),
            payload: payload.into(),
            published: 0,
        }
    }
}

/// Trait for inserting outbox rows.
///
/// The insert must enlist in the transaction handed in by the caller so
/// the row commits or rolls back together with the business write. An
/// unpublished row that exists without its business write, or the other
/// way around, is a lost or phantom message.
#[async_trait::async_trait]
pub trait InsertRecord {
    /// Backend-specific error type.
    type Error;
    /// Transaction type the insert enlists in.
    type Transaction<'a>: Send;

    /// Insert one record within `tx`.
    async fn insert_record(
        &self,
        record: OutboxRecord,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}
