//! # recopy core
//!
//! Foundational types and traits shared by every recopy crate. Records flow
//! through the copier as a single, encoding-independent value tree
//! ([`Record`]) tagged with the schema and source they came from
//! ([`RecordMetadata`]).
//!
//! ## Key Components
//!
//! - **Value model**: [`Record`], convertible from JSON and Avro values
//! - **Stream items**: [`StreamItem`] pairs a record with its [`RecordMetadata`]
//! - **Operator traits**: [`RecordStream`] (pull side) and [`RecordWriter`] (push side)
//! - **Descriptors**: [`descriptor`] turns command line strings into typed sources and targets
//! - **Errors**: [`RecopyError`] for the conditions callers branch on
//!
//! ## Example Usage
//!
//! ```rust
//! use recopy_core::Record;
//!
//! let record = Record::from(serde_json::json!({"a": 1}));
//! assert_eq!(record.get("a"), Some(&Record::Int(1)));
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use apache_avro::types::Value as AvroValue;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

pub mod descriptor;

pub use descriptor::{BrokerDescriptor, SourceDescriptor, WriterTarget};

/// Shared handle to an Avro schema.
pub type SchemaRef = Arc<apache_avro::Schema>;

/// A decoded record, independent of the encoding it was read from.
///
/// JSON documents map onto every variant except [`Record::Bytes`], which only
/// the Avro decoder produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Raw byte string
    Bytes(Vec<u8>),
    Array(Vec<Record>),
    /// String-keyed mapping; key order carries no meaning
    Map(BTreeMap<String, Record>),
}

impl Record {
    /// Looks up a key when this record is a mapping.
    pub fn get(&self, key: &str) -> Option<&Record> {
        match self {
            Record::Map(fields) => fields.get(key),
            _ => None,
        }
    }
}

impl From<JsonValue> for Record {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Record::Null,
            JsonValue::Bool(b) => Record::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Record::Int(i),
                None => n.as_f64().map_or(Record::Null, Record::Float),
            },
            JsonValue::String(s) => Record::String(s),
            JsonValue::Array(items) => Record::Array(items.into_iter().map(Record::from).collect()),
            JsonValue::Object(fields) => Record::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Record::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<AvroValue> for Record {
    fn from(value: AvroValue) -> Self {
        match value {
            AvroValue::Null => Record::Null,
            AvroValue::Boolean(b) => Record::Bool(b),
            AvroValue::Int(n) => Record::Int(n.into()),
            AvroValue::Long(n) => Record::Int(n),
            AvroValue::Float(f) => Record::Float(f.into()),
            AvroValue::Double(f) => Record::Float(f),
            AvroValue::Bytes(b) | AvroValue::Fixed(_, b) => Record::Bytes(b),
            AvroValue::String(s) | AvroValue::Enum(_, s) => Record::String(s),
            AvroValue::Union(_, inner) => Record::from(*inner),
            AvroValue::Array(items) => Record::Array(items.into_iter().map(Record::from).collect()),
            AvroValue::Map(items) => Record::Map(
                items
                    .into_iter()
                    .map(|(k, v)| (k, Record::from(v)))
                    .collect(),
            ),
            AvroValue::Record(fields) => Record::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Record::from(v)))
                    .collect(),
            ),
            AvroValue::Date(n) | AvroValue::TimeMillis(n) => Record::Int(n.into()),
            AvroValue::TimeMicros(n)
            | AvroValue::TimestampMillis(n)
            | AvroValue::TimestampMicros(n)
            | AvroValue::TimestampNanos(n)
            | AvroValue::LocalTimestampMillis(n)
            | AvroValue::LocalTimestampMicros(n)
            | AvroValue::LocalTimestampNanos(n) => Record::Int(n),
            // the unscaled two's-complement bytes; the scale lives in the schema
            AvroValue::Decimal(d) => match Vec::<u8>::try_from(d) {
                Ok(bytes) => Record::Bytes(bytes),
                Err(e) => {
                    warn!(error = %e, "dropping unreadable avro decimal");
                    Record::Null
                }
            },
            AvroValue::BigDecimal(d) => Record::String(d.to_string()),
            AvroValue::Duration(d) => Record::Bytes(<[u8; 12]>::from(d).to_vec()),
            AvroValue::Uuid(u) => Record::String(u.to_string()),
        }
    }
}

/// Provenance attached to every record flowing through the copier.
#[derive(Debug, Clone)]
pub struct RecordMetadata {
    /// Schema the record was encoded with; absent for JSON input
    pub schema: Option<SchemaRef>,

    /// Display identity of the source: a file path, or a broker URL scoped
    /// to the exact topic the message arrived on
    pub source: String,
}

/// The unit flowing out of a [`RecordStream`].
#[derive(Debug, Clone)]
pub struct StreamItem {
    pub record: Record,
    pub meta: RecordMetadata,
}

/// Record encodings understood by the decoders and writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Avro,
}

impl Format {
    /// Infers a format from a file extension (`.json`, `.jsonl`, `.avro`).
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" | "jsonl" => Some(Format::Json),
            "avro" => Some(Format::Avro),
            _ => None,
        }
    }
}

/// How input bytes are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputFormat {
    /// Try JSON first, then Avro
    #[default]
    Auto,
    Exactly(Format),
}

/// Error types callers of the recopy crates branch on
///
/// Everything else travels as a plain `anyhow::Error` with context attached.
#[derive(Debug, thiserror::Error)]
pub enum RecopyError {
    /// Malformed `kafka://` URL
    #[error("invalid broker url `{url}`: {reason}")]
    InvalidBrokerUrl { url: String, reason: &'static str },

    /// A topic pattern that does not compile as a regular expression
    #[error("invalid topic pattern `{pattern}`: {source}")]
    InvalidTopicPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("only one broker source may be given")]
    MultipleBrokerSources,

    #[error("the broker source must be the last source")]
    BrokerSourceNotLast,

    /// Destination format neither given nor inferable from the destination
    #[error("cannot determine the output format of `{0}`; pass --to")]
    UnknownOutputFormat(String),

    /// A record that cannot be written under the working Avro schema
    #[error("field `{field}` does not fit the avro schema: {reason}")]
    SchemaMismatch { field: String, reason: String },

    /// Avro output with no schema from `--schema` or from the input
    #[error("writing avro needs a schema, but none was given and none was found in the input")]
    MissingSchema,

    /// Any broker-reported error other than a partition boundary
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pull side of the pipeline
///
/// A stream lazily yields [`StreamItem`]s and owns whatever resources its
/// sources hold (file handles, consumer sessions).
#[async_trait]
pub trait RecordStream: Send {
    /// Pulls the next item, or `None` once every source is exhausted.
    async fn next_item(&mut self) -> Result<Option<StreamItem>>;

    /// Releases the currently open source. Safe to call more than once;
    /// a closed stream yields nothing further.
    fn close(&mut self) -> Result<()>;
}

/// Push side of the pipeline
///
/// Writers are built once the working schema is fixed and write every record
/// under that schema.
#[async_trait]
pub trait RecordWriter: Send {
    /// Appends one record.
    async fn write(&mut self, record: &Record) -> Result<()>;

    /// Flushes buffered output and releases the destination. Called exactly
    /// once per session, even when a write failed.
    fn close(&mut self) -> Result<()>;
}
