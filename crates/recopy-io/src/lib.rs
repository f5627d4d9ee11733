//! # recopy I/O - decoders, sources and writers
//!
//! Everything that touches bytes: the JSON and Avro decoders, the Kafka
//! consumer adapter, the multiplexer that chains sources into one
//! [`RecordStream`](recopy_core::RecordStream), the schema resolver, and the
//! four writers behind [`RecordWriter`].
//!
//! ## Writers
//!
//! | format | file              | topic              |
//! |--------|-------------------|--------------------|
//! | JSON   | [`JsonFileWriter`]| [`JsonTopicWriter`]|
//! | Avro   | [`AvroFileWriter`]| [`AvroTopicWriter`]|

use anyhow::Result;
use apache_avro::Schema;
use recopy_core::{Format, RecordWriter, WriterTarget};

/// librdkafka client properties
pub mod client;

/// Record to Avro value shaping under a schema
pub mod conform;

/// JSON and Avro pull decoders
pub mod decode;

/// Source multiplexer
pub mod multiplex;

/// Working-schema resolution
pub mod schema;

/// File writers
pub mod sink_file;

/// Kafka topic writers
pub mod sink_kafka;

/// Kafka consumer adapter
pub mod source_kafka;

pub use client::ClientProps;
pub use conform::Conformer;
pub use multiplex::Multiplexer;
pub use schema::{resolve_schema, save_schema, PushBack};
pub use sink_file::{AvroFileWriter, JsonFileWriter};
pub use sink_kafka::{AvroTopicWriter, JsonTopicWriter};

/// Builds the writer for a destination and format.
///
/// Avro writers borrow the working schema for their whole lifetime. Without a
/// schema they still open, and fail on the first write.
pub fn open_writer<'s>(
    target: &WriterTarget,
    format: Format,
    schema: Option<&'s Schema>,
    props: &ClientProps,
) -> Result<Box<dyn RecordWriter + 's>> {
    Ok(match (format, target) {
        (Format::Json, WriterTarget::File { path }) => Box::new(JsonFileWriter::create(path)?),
        (Format::Avro, WriterTarget::File { path }) => Box::new(AvroFileWriter::create(path, schema)?),
        (Format::Json, WriterTarget::Broker { brokers, topic }) => {
            Box::new(JsonTopicWriter::create(brokers, topic, props)?)
        }
        (Format::Avro, WriterTarget::Broker { brokers, topic }) => {
            Box::new(AvroTopicWriter::create(brokers, topic, schema, props)?)
        }
    })
}
