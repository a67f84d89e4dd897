#![doc = include_str!("../README.md")]

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod ids;
pub mod inbox;
pub mod interceptor;
pub mod message;
pub mod outbox;
pub mod producer;
pub mod publisher;
pub mod scope;

#[doc(inline)]
pub use message::{Message, headers};

#[doc(inline)]
pub use producer::{MessageProducer, SendError, SendErrorKind};

#[doc(inline)]
pub use publisher::{DomainEvent, DomainEventPublisher};

#[doc(inline)]
pub use consumer::{
    MessageConsumer, MessageHandler, SubscribeError, SubscribeErrorKind, Subscription,
};

#[doc(inline)]
pub use dispatcher::{
    DomainEventEnvelope, DomainEventHandlers, subscribe_domain_events,
};

#[doc(inline)]
pub use config::{ConsumerConfig, ShutdownMode};

#[doc(inline)]
pub use interceptor::{InterceptorStack, MessageInterceptor};

#[doc(inline)]
pub use scope::{ServiceRegistry, ServiceScope};
