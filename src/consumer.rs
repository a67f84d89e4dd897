//! Broker consumer: subscriptions, fetch loop and dispatch engine.
//!
//! A [`MessageConsumer`] owns a set of [`Subscription`]s. Each
//! subscription owns exactly one broker source (consumer group =
//! subscriber id) and one swimlane map, and runs a long-lived fetch loop:
//!
//! ```text
//! broker source ──poll──▶ decode ──▶ swimlane(partition) ──▶ decorator
//!        ▲                                                    chain ──▶ handler
//!        └──────────── safe-offset commits ◀── completions ─────┘
//! ```
//!
//! Offsets are committed only once every lower offset on the partition
//! completed successfully; a handler failure stalls the partition so the
//! records are redelivered after a restart or rebalance.

pub mod chain;
pub mod inmemory;
pub mod offsets;
pub mod swimlane;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::config::ConsumerConfig;
use crate::consumer::chain::DecoratorChain;
use crate::consumer::offsets::OffsetTracker;
use crate::consumer::swimlane::{Completion, LaneConsumer, SwimlaneMap};
use crate::inbox::ExactlyOnce;
use crate::interceptor::InterceptorStack;
use crate::message::Message;
use crate::scope::{ServiceRegistry, ServiceScope};

/// Boxed handler future, the currency of the dispatch path.
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<(), tower::BoxError>> + Send>>;

/// A subscription's message handler.
///
/// Closures work too: any `Fn(Message, ServiceScope) -> HandlerFuture`.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message, scope: ServiceScope) -> HandlerFuture;
}

impl<F> MessageHandler for F
where
    F: Fn(Message, ServiceScope) -> HandlerFuture + Send + Sync,
{
    fn handle(&self, message: Message, scope: ServiceScope) -> HandlerFuture {
        self(message, scope)
    }
}

/// One record fetched from the broker.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// A live broker session for one subscription.
#[async_trait::async_trait]
pub trait MessageSource: Send {
    /// Fetch the next record, waiting at most `timeout`.
    ///
    /// The bounded wait is what makes shutdown responsive: cancellation
    /// is observed within one poll interval.
    async fn poll(&mut self, timeout: Duration)
    -> Result<Option<SourceRecord>, tower::BoxError>;

    /// Commit `next_offset` as the next-to-read position.
    async fn commit(
        &mut self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), tower::BoxError>;
}

/// A broker that can open sources for consumer groups.
#[async_trait::async_trait]
pub trait SubscribeSource: Send + Sync {
    type Source: MessageSource + 'static;

    /// Open a source consuming `channels` under group `subscriber_id`.
    async fn subscribe(
        &self,
        subscriber_id: &str,
        channels: &[String],
    ) -> Result<Self::Source, tower::BoxError>;
}

/// Owns every subscription created through it.
pub struct MessageConsumer<B> {
    broker: B,
    inbox: Arc<dyn ExactlyOnce>,
    interceptors: InterceptorStack,
    registry: Arc<ServiceRegistry>,
    config: ConsumerConfig,
    subscriptions: tokio::sync::Mutex<Vec<Subscription>>,
}

impl<B> MessageConsumer<B>
where
    B: SubscribeSource,
{
    pub fn new(broker: B, inbox: Arc<dyn ExactlyOnce>) -> Self {
        Self {
            broker,
            inbox,
            interceptors: InterceptorStack::default(),
            registry: Arc::new(ServiceRegistry::new()),
            config: ConsumerConfig::default(),
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Interceptors invoked around every receive and handle.
    pub fn with_interceptors(mut self, interceptors: InterceptorStack) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Services resolvable from handler scopes.
    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe `handler` to `channels` under the `subscriber_id` group.
    ///
    /// Spawns the fetch loop immediately; the returned [`Subscription`]
    /// stops it.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        channels: impl IntoIterator<Item = impl Into<String>>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, SubscribeError> {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            return Err(SubscribeError::no_channels());
        }

        let source = self
            .broker
            .subscribe(subscriber_id, &channels)
            .await
            .map_err(SubscribeError::broker)?;

        let chain = DecoratorChain::standard(
            subscriber_id,
            self.interceptors.clone(),
            Arc::clone(&self.inbox),
            Arc::clone(&self.registry),
            handler,
        );

        let subscription =
            Subscription::spawn(subscriber_id, source, chain, self.config.clone());
        self.subscriptions.lock().await.push(subscription.clone());
        Ok(subscription)
    }

    /// Stop every subscription. Idempotent; later `unsubscribe` calls on
    /// the returned subscriptions are no-ops.
    pub async fn close(&self) {
        let subscriptions = {
            let mut guard = self.subscriptions.lock().await;
            std::mem::take(&mut *guard)
        };
        for subscription in subscriptions {
            subscription.unsubscribe().await;
        }
    }
}

/// Handle to one running subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    subscriber_id: String,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn spawn<S>(
        subscriber_id: &str,
        source: S,
        chain: DecoratorChain,
        config: ConsumerConfig,
    ) -> Self
    where
        S: MessageSource + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(subscription_loop(
            source,
            chain,
            config,
            cancel.clone(),
            subscriber_id.to_owned(),
        ));
        Self {
            inner: Arc::new(SubscriptionInner {
                subscriber_id: subscriber_id.to_owned(),
                cancel,
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.inner.subscriber_id
    }

    /// Stop the fetch loop, drain the swimlanes per the shutdown mode and
    /// commit final safe offsets. Idempotent.
    pub async fn unsubscribe(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task
            && task.await.is_err()
        {
            tracing::warn!(
                subscriber_id = %self.inner.subscriber_id,
                "subscription loop ended abnormally"
            );
        }
    }
}

async fn subscription_loop<S>(
    mut source: S,
    chain: DecoratorChain,
    config: ConsumerConfig,
    cancel: CancellationToken,
    subscriber_id: String,
) where
    S: MessageSource,
{
    tracing::info!(subscriber_id = %subscriber_id, "subscription started");

    let swimlanes = Arc::new(SwimlaneMap::new());
    let tracker = Arc::new(Mutex::new(OffsetTracker::new()));
    let mut last_commit = tokio::time::Instant::now();

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = source.poll(config.poll_interval) => polled,
        };

        match polled {
            Ok(Some(record)) => {
                dispatch_record(record, &chain, &swimlanes, &tracker);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    subscriber_id = %subscriber_id,
                    "broker poll failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_backoff) => {}
                }
            }
        }

        if last_commit.elapsed() >= config.commit_interval {
            commit_safe(&mut source, &tracker).await;
            last_commit = tokio::time::Instant::now();
        }
    }

    // shutdown: no further dispatches; drain lanes per policy, then make
    // the final offsets durable
    swimlanes.stop_all(config.shutdown).await;
    commit_safe(&mut source, &tracker).await;
    tracing::info!(subscriber_id = %subscriber_id, "subscription stopped");
}

fn dispatch_record(
    record: SourceRecord,
    chain: &DecoratorChain,
    swimlanes: &Arc<SwimlaneMap>,
    tracker: &Arc<Mutex<OffsetTracker>>,
) {
    let SourceRecord {
        topic,
        partition,
        offset,
        payload,
    } = record;

    {
        let guard = tracker.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_halted(&topic, partition) {
            tracing::debug!(
                topic = %topic,
                partition,
                offset,
                "partition halted by an earlier failure, leaving record for redelivery"
            );
            return;
        }
    }

    let message = match Message::decode(&payload) {
        Ok(message) => message,
        Err(error) => {
            // poison pill: acknowledge so the partition keeps moving
            tracing::error!(
                error = %error,
                topic = %topic,
                partition,
                offset,
                "undecodable record acknowledged without dispatch"
            );
            let mut guard = tracker.lock().unwrap_or_else(|e| e.into_inner());
            guard.track(&topic, partition, offset);
            guard.complete(&topic, partition, offset);
            return;
        }
    };

    tracker
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .track(&topic, partition, offset);

    let lane = swimlanes.lane(partition);
    let lane_cancel = lane.cancellation();
    let chain = chain.clone();
    let consumer: LaneConsumer = Arc::new(move |message: Message| {
        let chain = chain.clone();
        let cancel = lane_cancel.clone();
        Box::pin(async move { chain.dispatch(message, cancel).await })
    });

    let completion: Completion = {
        let tracker = Arc::clone(tracker);
        let topic = topic.clone();
        Box::new(move |result| {
            let mut guard = tracker.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(()) => guard.complete(&topic, partition, offset),
                Err(_) => guard.fail(&topic, partition, offset),
            }
        })
    };

    if lane.dispatch(message, consumer, completion).is_err() {
        // lane already stopped; the tracked offset stays uncommitted so
        // the record comes back on the next start
        tracing::debug!(topic = %topic, partition, offset, "swimlane stopped, record dropped");
    }
}

async fn commit_safe<S>(source: &mut S, tracker: &Arc<Mutex<OffsetTracker>>)
where
    S: MessageSource,
{
    let committable = tracker
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain_committable();
    for (topic, partition, next_offset) in committable {
        if let Err(error) = source.commit(&topic, partition, next_offset).await {
            tracing::warn!(
                error = %error,
                topic = %topic,
                partition,
                "offset commit failed"
            );
        }
    }
}

/// Error returned by [`MessageConsumer::subscribe`].
#[derive(Debug)]
pub struct SubscribeError {
    context: SpanTrace,
    kind: SubscribeErrorKind,
}

/// Classification of subscribe failures.
#[derive(Debug)]
pub enum SubscribeErrorKind {
    /// The channel set was empty.
    NoChannels,
    /// The broker rejected the subscription.
    Broker(tower::BoxError),
}

impl SubscribeError {
    fn no_channels() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SubscribeErrorKind::NoChannels,
        }
    }

    fn broker(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SubscribeErrorKind::Broker(err),
        }
    }

    pub fn kind(&self) -> &SubscribeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SubscribeErrorKind::NoChannels => {
                writeln!(f, "Subscription needs at least one channel")
            }
            SubscribeErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SubscribeErrorKind::NoChannels => None,
            SubscribeErrorKind::Broker(err) => Some(err.as_ref()),
        }
    }
}
