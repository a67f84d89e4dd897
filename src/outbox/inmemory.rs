use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::outbox::{InsertRecord, OutboxRecord};

/// An in-memory outbox for testing or single-process deployments.
///
/// Rows are kept in insertion order, which stands in for commit order.
/// There is no real transaction to enlist in, so `Transaction` is `()`.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    rows: Arc<Mutex<Vec<OutboxRecord>>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, published or not.
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.rows.lock().await.clone()
    }

    /// Number of rows the relay has not yet picked up.
    pub async fn unpublished_count(&self) -> usize {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|row| row.published == 0)
            .count()
    }

    /// Mark all unpublished rows published and return them in id order.
    ///
    /// This is the relay's read side; ids are time-ordered so sorting by
    /// id reproduces send order.
    pub async fn drain_unpublished(&self) -> Vec<OutboxRecord> {
        let mut rows = self.rows.lock().await;
        let mut due: Vec<OutboxRecord> = rows
            .iter_mut()
            .filter(|row| row.published == 0)
            .map(|row| {
                row.published = 1;
                row.clone()
            })
            .collect();
        due.sort_by(|a, b| a.id.cmp(&b.id));
        due
    }
}

#[async_trait]
impl InsertRecord for InMemoryOutbox {
    type Error = Infallible;
    type Transaction<'a> = ();

    async fn insert_record(
        &self,
        record: OutboxRecord,
        _tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        self.rows.lock().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_marks_published_and_sorts_by_id() {
        let outbox = InMemoryOutbox::new();
        let mut tx = ();
        outbox
            .insert_record(OutboxRecord::new("b", "t", "{}", "2"), &mut tx)
            .await
            .unwrap();
        outbox
            .insert_record(OutboxRecord::new("a", "t", "{}", "1"), &mut tx)
            .await
            .unwrap();

        let drained = outbox.drain_unpublished().await;
        assert_eq!(
            drained.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        assert_eq!(outbox.unpublished_count().await, 0);
        assert!(outbox.drain_unpublished().await.is_empty());
        assert_eq!(outbox.records().await.len(), 2);
    }
}
