use std::time::Duration;

use anyhow::{Context, Result};
use apache_avro::{Schema, Writer};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use recopy_core::{Record, RecopyError, RecordWriter};
use recopy_tx::encode_json_line;
use tracing::{debug, info};

use crate::client::ClientProps;
use crate::conform::Conformer;
use crate::sink_file::{avro_datum, AVRO_CODEC};

/// How long `close()` waits for outstanding deliveries.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Producer bound to one destination topic.
struct TopicProducer {
    producer: FutureProducer,
    topic: String,
    sent: u64,
    closed: bool,
}

impl TopicProducer {
    fn create(brokers: &[String], topic: &str, props: &ClientProps) -> Result<Self> {
        let mut config = ClientConfig::new();
        props.apply(&mut config);
        let producer: FutureProducer = config
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "30000")
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic, "producing to kafka");
        Ok(Self {
            producer,
            topic: topic.to_string(),
            sent: 0,
            closed: false,
        })
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            anyhow::bail!("producer for {} is closed", self.topic);
        }
        let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(payload);
        self.producer
            .send(record, Duration::from_secs(0))
            .await
            .map_err(|(e, _)| RecopyError::Kafka(e))?;
        self.sent += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.producer.flush(FLUSH_TIMEOUT).map_err(RecopyError::Kafka)?;
        info!(topic = %self.topic, sent = self.sent, "producer flushed");
        Ok(())
    }
}

/// One JSON document per message.
pub struct JsonTopicWriter {
    inner: TopicProducer,
}

impl JsonTopicWriter {
    pub fn create(brokers: &[String], topic: &str, props: &ClientProps) -> Result<Self> {
        Ok(Self {
            inner: TopicProducer::create(brokers, topic, props)?,
        })
    }
}

#[async_trait]
impl RecordWriter for JsonTopicWriter {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let payload = encode_json_line(record)?;
        self.inner.send(&payload).await
    }

    fn close(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// One single-record Avro container per message, so every message carries
/// its schema.
pub struct AvroTopicWriter<'s> {
    inner: TopicProducer,
    conformer: Option<Conformer<'s>>,
}

impl<'s> AvroTopicWriter<'s> {
    pub fn create(brokers: &[String], topic: &str, schema: Option<&'s Schema>, props: &ClientProps) -> Result<Self> {
        Ok(Self {
            inner: TopicProducer::create(brokers, topic, props)?,
            conformer: schema.map(Conformer::new).transpose()?,
        })
    }
}

/// Encodes one record as a complete container file.
pub fn avro_message(record: &Record, conformer: &Conformer<'_>) -> Result<Vec<u8>> {
    let mut writer = Writer::with_codec(conformer.schema(), Vec::new(), AVRO_CODEC);
    writer.append(avro_datum(record, conformer)?)?;
    let bytes = writer.into_inner()?;
    debug!(len = bytes.len(), "encoded avro message");
    Ok(bytes)
}

#[async_trait]
impl<'s> RecordWriter for AvroTopicWriter<'s> {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let conformer = self.conformer.as_ref().ok_or(RecopyError::MissingSchema)?;
        let payload = avro_message(record, conformer)?;
        self.inner.send(&payload).await
    }

    fn close(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
