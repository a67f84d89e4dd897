use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message as _, Offset, TopicPartitionList};

use crate::consumer::{MessageSource, SourceRecord, SubscribeSource};

/// Connection settings for Kafka sources.
///
/// The consumer group id is *not* part of the config: it is always the
/// subscriber id, so group coordination hands each partition to exactly
/// one member of a subscriber fleet.
#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    bootstrap_servers: String,
    session_timeout: Duration,
    auto_offset_reset: String,
    properties: HashMap<String, String>,
}

impl Default for KafkaSourceConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_owned(),
            session_timeout: Duration::from_secs(10),
            auto_offset_reset: "earliest".to_owned(),
            properties: HashMap::new(),
        }
    }
}

impl KafkaSourceConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Self::default()
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_auto_offset_reset(mut self, reset: impl Into<String>) -> Self {
        self.auto_offset_reset = reset.into();
        self
    }

    /// Pass an extra librdkafka property verbatim.
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Kafka-backed broker handle.
#[derive(Debug, Clone, Default)]
pub struct KafkaBroker {
    config: KafkaSourceConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SubscribeSource for KafkaBroker {
    type Source = KafkaSource;

    async fn subscribe(
        &self,
        subscriber_id: &str,
        channels: &[String],
    ) -> Result<Self::Source, tower::BoxError> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", subscriber_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.config.session_timeout.as_millis().to_string(),
            );
        for (key, value) in &self.config.properties {
            client.set(key, value);
        }

        let consumer: StreamConsumer = client.create()?;
        let topics: Vec<&str> = channels.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        Ok(KafkaSource { consumer })
    }
}

/// One subscription's Kafka session.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<SourceRecord>, tower::BoxError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(record)) => Ok(Some(SourceRecord {
                topic: record.topic().to_owned(),
                partition: record.partition(),
                offset: record.offset(),
                payload: record.payload().unwrap_or_default().to_vec(),
            })),
        }
    }

    async fn commit(
        &mut self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), tower::BoxError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}
