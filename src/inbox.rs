//! Inbox: the database-backed duplicate gate for consumers.
//!
//! Every subscriber records handled messages in a `received_messages`
//! table keyed by `(message_id, consumer_id)`. Claiming that key is the
//! atomic grant to run the handler: a conflict means the message was
//! already handled and the handler must not run again.
//!
//! The claim and the handler run inside one transaction. If the handler
//! fails, the claim rolls back with it, so a redelivery can retry the
//! message from scratch.

pub mod inmemory;

#[cfg(feature = "postgres")]
pub mod sqlx;

use std::future::Future;
use std::pin::Pin;

/// Continuation executed under a successful claim.
pub type ClaimedWork = Pin<Box<dyn Future<Output = Result<(), tower::BoxError>> + Send>>;

/// What happened to a message offered to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// First delivery; the continuation ran and the claim is committed.
    Handled,
    /// The claim already existed; the continuation did not run.
    Duplicate,
}

/// Exactly-once execution gate.
#[async_trait::async_trait]
pub trait ExactlyOnce: Send + Sync {
    /// Claim `(message_id, consumer_id)` and run `work` under the claim.
    ///
    /// Returns [`ReceiveOutcome::Duplicate`] without running `work` when
    /// the claim already exists. If `work` fails the claim must be rolled
    /// back before the error propagates.
    async fn process_exactly_once(
        &self,
        message_id: &str,
        consumer_id: &str,
        work: Box<dyn FnOnce() -> ClaimedWork + Send>,
    ) -> Result<ReceiveOutcome, tower::BoxError>;
}
