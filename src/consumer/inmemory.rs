//! In-memory broker and relay for tests and single-process pipelines.
//!
//! The broker models a partitioned log: each topic is a set of
//! append-only partition logs, and consumer groups track a committed
//! offset per partition. Placement follows the record key: records
//! sharing a `PARTITION_ID` land in the same partition, keyless records
//! are spread round-robin.
//!
//! [`InMemoryRelay`] is the in-process stand-in for the external CDC
//! relay: it drains unpublished outbox rows in id order and appends them
//! to the broker.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHasher;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consumer::{MessageSource, SourceRecord, SubscribeSource};
use crate::message::{Message, headers};
use crate::outbox::OutboxRecord;
use crate::outbox::inmemory::InMemoryOutbox;

const POLL_STEP: Duration = Duration::from_millis(2);

struct TopicLog {
    partitions: Vec<Vec<Vec<u8>>>,
    next_round_robin: usize,
}

impl TopicLog {
    fn with_partitions(count: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); count.max(1)],
            next_round_robin: 0,
        }
    }
}

#[derive(Default)]
struct BrokerInner {
    topics: HashMap<String, TopicLog>,
    /// (group, topic, partition) → next offset to read
    committed: HashMap<(String, String, i32), i64>,
}

/// Partitioned in-memory log broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pre-create `topic` with a fixed partition count. Publishing to an
    /// unknown topic auto-creates it with a single partition.
    pub fn create_topic(&self, topic: impl Into<String>, partitions: usize) {
        self.lock()
            .topics
            .entry(topic.into())
            .or_insert_with(|| TopicLog::with_partitions(partitions));
    }

    /// Append a record; the key picks the partition.
    pub fn publish(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) {
        let mut inner = self.lock();
        let log = inner
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| TopicLog::with_partitions(1));
        let total = log.partitions.len();
        let partition = match key {
            Some(key) => partition_for(key, total),
            None => {
                let next = log.next_round_robin;
                log.next_round_robin = (next + 1) % total;
                next
            }
        };
        log.partitions[partition].push(payload);
    }

    /// Committed next-to-read offset for a group, if any.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    /// Total records appended to `topic` across partitions.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

/// Hash a routing key onto a partition, the same way for every publisher.
fn partition_for(key: &str, total: usize) -> usize {
    let mut hasher = AHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() % total as u64) as usize
}

#[async_trait]
impl SubscribeSource for InMemoryBroker {
    type Source = InMemorySource;

    async fn subscribe(
        &self,
        subscriber_id: &str,
        channels: &[String],
    ) -> Result<Self::Source, tower::BoxError> {
        Ok(InMemorySource {
            broker: self.clone(),
            group: subscriber_id.to_owned(),
            channels: channels.to_vec(),
            positions: HashMap::new(),
        })
    }
}

/// One group's view of the broker.
///
/// Read positions start from the group's committed offsets, so records
/// whose offsets were never committed are redelivered to the next source
/// opened under the same group.
pub struct InMemorySource {
    broker: InMemoryBroker,
    group: String,
    channels: Vec<String>,
    positions: HashMap<(String, i32), i64>,
}

impl InMemorySource {
    fn try_next(&mut self) -> Option<SourceRecord> {
        let inner = self.broker.lock();
        for topic in &self.channels {
            let Some(log) = inner.topics.get(topic) else {
                continue;
            };
            for (partition, records) in log.partitions.iter().enumerate() {
                let partition = partition as i32;
                let key = (topic.clone(), partition);
                let position = *self.positions.entry(key.clone()).or_insert_with(|| {
                    inner
                        .committed
                        .get(&(self.group.clone(), topic.clone(), partition))
                        .copied()
                        .unwrap_or(0)
                });
                if (position as usize) < records.len() {
                    let payload = records[position as usize].clone();
                    self.positions.insert(key, position + 1);
                    return Some(SourceRecord {
                        topic: topic.clone(),
                        partition,
                        offset: position,
                        payload,
                    });
                }
            }
        }
        None
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn poll(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<SourceRecord>, tower::BoxError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_next() {
                return Ok(Some(record));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn commit(
        &mut self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), tower::BoxError> {
        self.broker.lock().committed.insert(
            (self.group.clone(), topic.to_owned(), partition),
            next_offset,
        );
        Ok(())
    }
}

/// Moves committed outbox rows into the in-memory broker.
pub struct InMemoryRelay {
    outbox: InMemoryOutbox,
    broker: InMemoryBroker,
    interval: Duration,
}

impl InMemoryRelay {
    pub fn new(outbox: InMemoryOutbox, broker: InMemoryBroker) -> Self {
        Self {
            outbox,
            broker,
            interval: Duration::from_millis(10),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until cancelled, draining on a fixed interval.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.drain_once().await,
                }
            }
        })
    }

    /// Relay every currently unpublished row, in id order.
    pub async fn drain_once(&self) {
        for row in self.outbox.drain_unpublished().await {
            match relay_payload(&row) {
                Ok((key, payload)) => {
                    self.broker.publish(&row.destination, key.as_deref(), payload);
                }
                Err(error) => {
                    // the row is already marked published; a row that
                    // cannot be framed can never be delivered
                    tracing::error!(
                        error = %error,
                        id = %row.id,
                        "outbox row could not be framed for the broker, skipped"
                    );
                }
            }
        }
    }
}

/// Frame an outbox row as a broker record: `(key, wire bytes)`.
fn relay_payload(row: &OutboxRecord) -> Result<(Option<String>, Vec<u8>), tower::BoxError> {
    let header_map: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&row.headers)?;
    let key = header_map.get(headers::PARTITION_ID).cloned();
    let message = Message {
        id: row.id.clone(),
        headers: header_map,
        payload: row.payload.clone(),
    };
    Ok((key, message.encode()?))
}
