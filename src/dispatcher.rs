//! Typed domain-event dispatch.
//!
//! Handlers are registered in a table keyed by
//! `(aggregate_type, event_type)`; at dispatch time the message's
//! `DESTINATION` and `EVENT_TYPE` headers select the entry, the payload
//! is decoded into the concrete event type and every matching handler
//! runs with a [`DomainEventEnvelope`] plus a service scope.
//!
//! A message with no matching entry is acknowledged silently: subscribers
//! routinely share topics with event types they do not care about.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::consumer::{
    HandlerFuture, MessageConsumer, MessageHandler, SubscribeError, SubscribeSource,
    Subscription,
};
use crate::message::{Message, headers};
use crate::publisher::DomainEvent;
use crate::scope::ServiceScope;

/// A decoded event together with its envelope metadata.
#[derive(Debug, Clone)]
pub struct DomainEventEnvelope<E> {
    pub message: Message,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event: E,
}

type ErasedHandler = Arc<dyn Fn(Message, ServiceScope) -> HandlerFuture + Send + Sync>;

/// Immutable handler table built once per subscriber.
#[derive(Clone, Default)]
pub struct DomainEventHandlers {
    table: HashMap<(String, String), Vec<ErasedHandler>>,
    channels: BTreeSet<String>,
}

impl DomainEventHandlers {
    /// Start registering handlers for one aggregate type.
    pub fn for_aggregate_type(aggregate_type: impl Into<String>) -> DomainEventHandlersBuilder {
        DomainEventHandlersBuilder {
            aggregate_type: aggregate_type.into(),
            handlers: DomainEventHandlers::default(),
        }
    }

    /// The topics this table listens on: its aggregate types.
    pub fn channels(&self) -> impl Iterator<Item = &String> {
        self.channels.iter()
    }
}

/// Builder returned by [`DomainEventHandlers::for_aggregate_type`].
pub struct DomainEventHandlersBuilder {
    aggregate_type: String,
    handlers: DomainEventHandlers,
}

impl DomainEventHandlersBuilder {
    /// Register a handler for event type `E` on the current aggregate.
    pub fn on_event<E, F, Fut>(mut self, handler: F) -> Self
    where
        E: DomainEvent + DeserializeOwned + Send + 'static,
        F: Fn(DomainEventEnvelope<E>, ServiceScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
    {
        let key = (self.aggregate_type.clone(), E::event_type().to_owned());
        let erased: ErasedHandler = Arc::new(move |message: Message, scope: ServiceScope| {
            let envelope = match decode_envelope::<E>(&message) {
                Ok(envelope) => envelope,
                Err(error) => {
                    // poison payload: acknowledge, the bytes will never
                    // become valid on redelivery
                    tracing::error!(
                        error = %error,
                        message_id = %message.id,
                        "event payload rejected by decoder, acknowledged without handling"
                    );
                    let acked: HandlerFuture = Box::pin(async { Ok(()) });
                    return acked;
                }
            };
            Box::pin(handler(envelope, scope))
        });
        self.handlers.table.entry(key).or_default().push(erased);
        self.handlers.channels.insert(self.aggregate_type.clone());
        self
    }

    /// Switch to another aggregate type, keeping what was registered.
    pub fn and_for_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = aggregate_type.into();
        self
    }

    pub fn build(self) -> DomainEventHandlers {
        self.handlers
    }
}

fn decode_envelope<E>(message: &Message) -> Result<DomainEventEnvelope<E>, tower::BoxError>
where
    E: DeserializeOwned,
{
    let aggregate_type = message.required_header(headers::DESTINATION)?.to_owned();
    let aggregate_id = message
        .header(headers::EVENT_AGGREGATE_ID)
        .unwrap_or_default()
        .to_owned();
    let event: E = serde_json::from_str(&message.payload)?;
    Ok(DomainEventEnvelope {
        message: message.clone(),
        aggregate_type,
        aggregate_id,
        event,
    })
}

/// Terminal handler fanning messages out to the typed table.
pub struct DomainEventDispatcher {
    handlers: Arc<DomainEventHandlers>,
}

impl DomainEventDispatcher {
    pub fn new(handlers: DomainEventHandlers) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }
}

impl MessageHandler for DomainEventDispatcher {
    fn handle(&self, message: Message, scope: ServiceScope) -> HandlerFuture {
        let handlers = Arc::clone(&self.handlers);
        Box::pin(async move {
            let Some(destination) = message.destination().map(str::to_owned) else {
                tracing::warn!(message_id = %message.id, "message without destination skipped");
                return Ok(());
            };
            let Some(event_type) = message.header(headers::EVENT_TYPE).map(str::to_owned)
            else {
                tracing::debug!(message_id = %message.id, "message without event type skipped");
                return Ok(());
            };

            let Some(matched) = handlers.table.get(&(destination, event_type.clone()))
            else {
                tracing::debug!(
                    message_id = %message.id,
                    event_type = %event_type,
                    "no handler registered for event type, acknowledged"
                );
                return Ok(());
            };

            for handler in matched {
                handler(message.clone(), scope.clone()).await?;
            }
            Ok(())
        })
    }
}

/// Subscribe a handler table under `subscriber_id`; channels are the
/// table's aggregate types.
pub async fn subscribe_domain_events<B>(
    consumer: &MessageConsumer<B>,
    subscriber_id: &str,
    handlers: DomainEventHandlers,
) -> Result<Subscription, SubscribeError>
where
    B: SubscribeSource,
{
    let channels: Vec<String> = handlers.channels().cloned().collect();
    consumer
        .subscribe(
            subscriber_id,
            channels,
            Arc::new(DomainEventDispatcher::new(handlers)),
        )
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Credited {
        amount: i64,
    }

    impl DomainEvent for Credited {
        fn event_type() -> &'static str {
            "credited"
        }
    }

    fn message(destination: &str, event_type: &str, payload: &str) -> Message {
        let mut m = Message::build(payload)
            .header(headers::DESTINATION, destination)
            .header(headers::EVENT_TYPE, event_type)
            .header(headers::EVENT_AGGREGATE_ID, "acct-1")
            .finish();
        m.id = "m1".to_owned();
        m
    }

    fn scope() -> ServiceScope {
        ServiceScope::empty(CancellationToken::new())
    }

    #[tokio::test]
    async fn dispatches_to_the_matching_handler_with_decoded_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers = {
            let seen = Arc::clone(&seen);
            DomainEventHandlers::for_aggregate_type("Account")
                .on_event::<Credited, _, _>(move |envelope, _scope| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(envelope);
                        Ok(())
                    }
                })
                .build()
        };
        let dispatcher = DomainEventDispatcher::new(handlers);

        dispatcher
            .handle(message("Account", "credited", r#"{"amount":5}"#), scope())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event, Credited { amount: 5 });
        assert_eq!(seen[0].aggregate_type, "Account");
        assert_eq!(seen[0].aggregate_id, "acct-1");
    }

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged_silently() {
        let handlers = DomainEventHandlers::for_aggregate_type("Account")
            .on_event::<Credited, _, _>(|_envelope, _scope| async { Ok(()) })
            .build();
        let dispatcher = DomainEventDispatcher::new(handlers);

        let result = dispatcher
            .handle(message("Account", "debited", "{}"), scope())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn undecodable_payload_is_acknowledged_as_poison() {
        let called = Arc::new(Mutex::new(0));
        let handlers = {
            let called = Arc::clone(&called);
            DomainEventHandlers::for_aggregate_type("Account")
                .on_event::<Credited, _, _>(move |_envelope, _scope| {
                    let called = Arc::clone(&called);
                    async move {
                        *called.lock().unwrap() += 1;
                        Ok(())
                    }
                })
                .build()
        };
        let dispatcher = DomainEventDispatcher::new(handlers);

        let result = dispatcher
            .handle(message("Account", "credited", "not json"), scope())
            .await;

        assert!(result.is_ok());
        assert_eq!(*called.lock().unwrap(), 0);
    }
}
