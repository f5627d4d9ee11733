use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::ClientConfig;
use recopy_core::{BrokerDescriptor, RecopyError};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::ClientProps;

/// Upper bound on one poll, so commit deadlines are checked regularly.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum time between two periodic offset commits.
pub const COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Decides when a consumer session commits its offsets.
///
/// A disabled clock never asks for a commit. An enabled one asks whenever the
/// interval has elapsed since the last commit, and exactly once more when the
/// session finishes.
#[derive(Debug)]
pub struct CommitClock {
    enabled: bool,
    interval: Duration,
    last: Instant,
}

impl CommitClock {
    pub fn new(enabled: bool, interval: Duration, now: Instant) -> Self {
        Self {
            enabled,
            interval,
            last: now,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// True when a periodic commit is due at `now`; restarts the interval.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.enabled || now.saturating_duration_since(self.last) < self.interval {
            return false;
        }
        self.last = now;
        true
    }

    /// True when the final commit must be issued. Disables the clock.
    pub fn finish(&mut self) -> bool {
        std::mem::replace(&mut self.enabled, false)
    }
}

/// Consumer group id used when the URL names none.
pub fn ephemeral_group() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string());
    format!("recopy-{user}-{}", Uuid::new_v4().simple())
}

/// A message pulled from the broker, detached from the consumer.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Arc<[u8]>,
}

/// One consumer-group session bound to a broker descriptor.
///
/// Closing (explicitly or on drop) issues the final commit when committing is
/// enabled, then disconnects.
pub struct ConsumerSession {
    consumer: Option<StreamConsumer>,
    group_id: String,
    clock: CommitClock,
}

impl ConsumerSession {
    pub fn open(descriptor: &BrokerDescriptor, props: &ClientProps) -> Result<Self> {
        let (config, group_id, commit) = consumer_config(descriptor, props);
        let consumer: StreamConsumer = config
            .create()
            .with_context(|| format!("create kafka consumer for {}", descriptor.bootstrap_servers()))?;

        let patterns: Vec<&str> = descriptor.topic_patterns.iter().map(String::as_str).collect();
        consumer.subscribe(&patterns).map_err(RecopyError::Kafka)?;

        info!(
            group = %group_id,
            commit,
            topics = ?descriptor.topic_patterns,
            "subscribed to kafka"
        );
        Ok(Self {
            consumer: Some(consumer),
            group_id,
            clock: CommitClock::new(commit, COMMIT_INTERVAL, Instant::now()),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Waits for the next message. Partition boundaries are skipped; any
    /// other broker error is returned.
    pub async fn next_message(&mut self) -> Result<RawMessage> {
        let consumer = self
            .consumer
            .as_ref()
            .context("consumer session is closed")?;

        loop {
            if self.clock.tick(Instant::now()) {
                commit(consumer, CommitMode::Async)?;
                debug!(group = %self.group_id, "committed offsets");
            }

            match timeout(POLL_TIMEOUT, consumer.recv()).await {
                Err(_elapsed) => continue,
                Ok(Err(KafkaError::PartitionEOF(partition))) => {
                    debug!(partition, "reached end of partition");
                }
                Ok(Err(e)) => return Err(RecopyError::Kafka(e).into()),
                Ok(Ok(message)) => {
                    return Ok(RawMessage {
                        topic: message.topic().to_string(),
                        payload: Arc::from(message.payload().unwrap_or_default()),
                    });
                }
            }
        }
    }

    /// Final commit (if enabled), then disconnect. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };

        let committed = if self.clock.finish() {
            commit(&consumer, CommitMode::Sync)
        } else {
            Ok(())
        };
        consumer.unsubscribe();
        drop(consumer);

        info!(group = %self.group_id, "consumer session closed");
        committed
    }
}

impl Drop for ConsumerSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(group = %self.group_id, error = %e, "final commit failed");
        }
    }
}

/// Consumer properties for a descriptor: `(config, group id, commit enabled)`.
pub fn consumer_config(descriptor: &BrokerDescriptor, props: &ClientProps) -> (ClientConfig, String, bool) {
    let (group_id, commit) = match &descriptor.consumer_group {
        Some(group) => (group.clone(), true),
        None => (ephemeral_group(), false),
    };

    let mut config = ClientConfig::new();
    props.apply(&mut config);
    config
        .set("bootstrap.servers", descriptor.bootstrap_servers())
        .set("group.id", &group_id)
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "true")
        .set("auto.offset.reset", "earliest");
    (config, group_id, commit)
}

fn commit(consumer: &StreamConsumer, mode: CommitMode) -> Result<()> {
    match consumer.commit_consumer_state(mode) {
        Ok(()) => Ok(()),
        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
            debug!("no offsets to commit yet");
            Ok(())
        }
        Err(e) => Err(RecopyError::Kafka(e).into()),
    }
}
