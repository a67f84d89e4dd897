use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::inbox::{ClaimedWork, ExactlyOnce, ReceiveOutcome};

/// In-memory duplicate gate for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryInbox {
    claims: Arc<Mutex<BTreeSet<(String, String)>>>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed claims.
    pub async fn len(&self) -> usize {
        self.claims.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.claims.lock().await.is_empty()
    }

    /// Whether `(message_id, consumer_id)` is claimed.
    pub async fn contains(&self, message_id: &str, consumer_id: &str) -> bool {
        self.claims
            .lock()
            .await
            .contains(&(message_id.to_owned(), consumer_id.to_owned()))
    }
}

#[async_trait]
impl ExactlyOnce for InMemoryInbox {
    async fn process_exactly_once(
        &self,
        message_id: &str,
        consumer_id: &str,
        work: Box<dyn FnOnce() -> ClaimedWork + Send>,
    ) -> Result<ReceiveOutcome, tower::BoxError> {
        let key = (message_id.to_owned(), consumer_id.to_owned());
        {
            let mut claims = self.claims.lock().await;
            if !claims.insert(key.clone()) {
                return Ok(ReceiveOutcome::Duplicate);
            }
        }

        match work().await {
            Ok(()) => Ok(ReceiveOutcome::Handled),
            Err(err) => {
                // roll the claim back so a redelivery can retry
                self.claims.lock().await.remove(&key);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_work() -> Box<dyn FnOnce() -> ClaimedWork + Send> {
        Box::new(|| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn second_delivery_is_a_duplicate() {
        let inbox = InMemoryInbox::new();
        let first = inbox
            .process_exactly_once("m1", "sub", ok_work())
            .await
            .unwrap();
        let second = inbox
            .process_exactly_once("m1", "sub", ok_work())
            .await
            .unwrap();

        assert_eq!(first, ReceiveOutcome::Handled);
        assert_eq!(second, ReceiveOutcome::Duplicate);
        assert_eq!(inbox.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_consumers_claim_independently() {
        let inbox = InMemoryInbox::new();
        inbox
            .process_exactly_once("m1", "sub-a", ok_work())
            .await
            .unwrap();
        let other = inbox
            .process_exactly_once("m1", "sub-b", ok_work())
            .await
            .unwrap();

        assert_eq!(other, ReceiveOutcome::Handled);
        assert_eq!(inbox.len().await, 2);
    }

    #[tokio::test]
    async fn failed_work_rolls_back_the_claim() {
        let inbox = InMemoryInbox::new();
        let result = inbox
            .process_exactly_once(
                "m1",
                "sub",
                Box::new(|| Box::pin(async { Err("handler blew up".into()) })),
            )
            .await;

        assert!(result.is_err());
        assert!(!inbox.contains("m1", "sub").await);

        // the retry goes through
        let retry = inbox
            .process_exactly_once("m1", "sub", ok_work())
            .await
            .unwrap();
        assert_eq!(retry, ReceiveOutcome::Handled);
    }
}
