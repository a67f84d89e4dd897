use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use courier::consumer::inmemory::{InMemoryBroker, InMemoryRelay};
use courier::inbox::inmemory::InMemoryInbox;
use courier::outbox::inmemory::InMemoryOutbox;
use courier::{
    DomainEvent, DomainEventHandlers, DomainEventPublisher, MessageConsumer,
    MessageProducer, subscribe_domain_events,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountCredited {
    amount: i64,
}

impl DomainEvent for AccountCredited {
    fn event_type() -> &'static str {
        "account.credited"
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let outbox = InMemoryOutbox::new();
    let broker = InMemoryBroker::new();
    InMemoryRelay::new(outbox.clone(), broker.clone()).start(cancel.clone());

    let consumer = MessageConsumer::new(broker, Arc::new(InMemoryInbox::new()));
    let handlers = DomainEventHandlers::for_aggregate_type("Account")
        .on_event::<AccountCredited, _, _>(|envelope, _scope| async move {
            tracing::info!(
                aggregate_id = %envelope.aggregate_id,
                amount = envelope.event.amount,
                "credit received"
            );
            Ok(())
        })
        .build();
    subscribe_domain_events(&consumer, "ledger-service", handlers)
        .await
        .unwrap();

    let publisher = DomainEventPublisher::new(MessageProducer::new(outbox.clone()));
    let cancel_publish = cancel.clone();
    let publish_handle = tokio::spawn(async move {
        let mut amount = 0;
        loop {
            let mut tx = ();
            publisher
                .publish("Account", "acct-1", [AccountCredited { amount }], &mut tx)
                .await
                .expect("failed to publish");
            amount += 1;
            tokio::time::sleep(Duration::from_millis(500)).await;
            if cancel_publish.is_cancelled() {
                break;
            }
        }
    });

    tokio::try_join!(cancel_handle, publish_handle).unwrap();
    consumer.close().await;
}
