//! Record transforms applied on the way out of the copier.
//!
//! JSON has no byte string type, so raw bytes are rendered as
//! `data:application/octet-stream;base64,<payload>` text when writing JSON,
//! and text carrying that prefix is turned back into bytes when writing Avro.

use std::io;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use recopy_core::Record;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use tracing::debug;

/// Prefix of a byte string rendered as text.
pub const DATA_URI_PREFIX: &str = "data:application/octet-stream;base64,";

/// Renders bytes as a data URI.
pub fn data_uri(bytes: &[u8]) -> String {
    format!("{DATA_URI_PREFIX}{}", STANDARD.encode(bytes))
}

/// Decodes a data URI produced by [`data_uri`]; `None` for any other text.
pub fn parse_data_uri(text: &str) -> Option<Vec<u8>> {
    let payload = text.strip_prefix(DATA_URI_PREFIX)?;
    match STANDARD.decode(payload) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(error = %e, "text has the data uri prefix but is not base64");
            None
        }
    }
}

/// Converts a record into a JSON value, rendering bytes as data URIs.
///
/// Non-finite floats have no JSON form and become `null`.
pub fn to_json(record: &Record) -> Value {
    match record {
        Record::Null => Value::Null,
        Record::Bool(b) => Value::Bool(*b),
        Record::Int(n) => Value::from(*n),
        Record::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Record::String(s) => Value::String(s.clone()),
        Record::Bytes(b) => Value::String(data_uri(b)),
        Record::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        Record::Map(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
    }
}

/// Turns every data URI string inside the record back into raw bytes.
pub fn restore_bytes(record: Record) -> Record {
    match record {
        Record::String(s) => match parse_data_uri(&s) {
            Some(bytes) => Record::Bytes(bytes),
            None => Record::String(s),
        },
        Record::Array(items) => Record::Array(items.into_iter().map(restore_bytes).collect()),
        Record::Map(fields) => Record::Map(
            fields
                .into_iter()
                .map(|(k, v)| (k, restore_bytes(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Encodes one record as a single JSON line, without the line terminator.
///
/// Separators are `", "` and `": "`, so `{"a": 1}` rather than `{"a":1}`.
pub fn encode_json_line(record: &Record) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    to_json(record).serialize(&mut ser)?;
    Ok(out)
}

/// Compact formatter with a space after each separator.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}
