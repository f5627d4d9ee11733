//! Pull decoders for JSON and Avro input.
//!
//! Decoders read from a [`Rewind`] source so a failed attempt can start over
//! from the first byte: the JSON decoder falls back from whole-document to
//! line-delimited parsing that way, and autodetection falls back from JSON to
//! Avro.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Seek, SeekFrom};
use std::sync::Arc;

use anyhow::{Context, Result};
use recopy_core::{Format, InputFormat, Record, SchemaRef};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// Decoders tried, in order, when the input format is not given.
pub static AUTODETECT_ORDER: [Format; 2] = [Format::Json, Format::Avro];

/// A byte source that can be read again from the start.
pub trait Rewind: Send {
    /// Returns a reader positioned at the first byte of the source.
    fn rewind(&mut self) -> io::Result<Box<dyn BufRead + Send>>;
}

impl Rewind for File {
    fn rewind(&mut self) -> io::Result<Box<dyn BufRead + Send>> {
        self.seek(SeekFrom::Start(0))?;
        Ok(Box::new(BufReader::new(self.try_clone()?)))
    }
}

impl Rewind for Arc<[u8]> {
    fn rewind(&mut self) -> io::Result<Box<dyn BufRead + Send>> {
        Ok(Box::new(Cursor::new(Arc::clone(self))))
    }
}

/// One decoded record and the schema it was encoded with.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub record: Record,
    pub schema: Option<SchemaRef>,
}

/// Lazily decoded records of one source.
pub type Records = Box<dyn Iterator<Item = Result<Decoded>> + Send>;

/// Starts decoding `source`; `label` names it in log lines.
pub fn decode(format: InputFormat, mut source: Box<dyn Rewind>, label: &str) -> Result<Records> {
    match format {
        InputFormat::Exactly(format) => open(format, source.as_mut()),
        InputFormat::Auto => Ok(Box::new(AutoDetect {
            source,
            label: label.to_string(),
            remaining: AUTODETECT_ORDER.iter(),
            current: None,
        })),
    }
}

fn open(format: Format, source: &mut dyn Rewind) -> Result<Records> {
    match format {
        Format::Json => decode_json(source),
        Format::Avro => decode_avro(source),
    }
}

/// Whole document first; on failure, one document per non-blank line.
fn decode_json(source: &mut dyn Rewind) -> Result<Records> {
    let whole = serde_json::from_reader::<_, JsonValue>(source.rewind()?);
    if let Ok(doc) = whole {
        return Ok(Box::new(std::iter::once(Ok(Decoded {
            record: Record::from(doc),
            schema: None,
        }))));
    }

    let lines = source.rewind()?.lines().filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(
            serde_json::from_str::<JsonValue>(&line)
                .map(|doc| Decoded {
                    record: Record::from(doc),
                    schema: None,
                })
                .context("parse json line"),
        ),
        Err(e) => Some(Err(e).context("read json line")),
    });
    Ok(Box::new(lines))
}

/// Container file: the schema in the header tags every record.
fn decode_avro(source: &mut dyn Rewind) -> Result<Records> {
    let reader = apache_avro::Reader::new(source.rewind()?).context("open avro container")?;
    let schema: SchemaRef = Arc::new(reader.writer_schema().clone());
    Ok(Box::new(reader.map(move |value| {
        let value = value.context("read avro record")?;
        Ok(Decoded {
            record: Record::from(value),
            schema: Some(Arc::clone(&schema)),
        })
    })))
}

/// Tries each decoder in [`AUTODETECT_ORDER`], rewinding between attempts.
///
/// Records yielded before a decoder fails stay yielded. When every decoder
/// fails the source simply ends.
struct AutoDetect {
    source: Box<dyn Rewind>,
    label: String,
    remaining: std::slice::Iter<'static, Format>,
    current: Option<Records>,
}

impl Iterator for AutoDetect {
    type Item = Result<Decoded>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(records) = self.current.as_mut() else {
                let Some(format) = self.remaining.next() else {
                    warn!(source = %self.label, "no decoder could read this source");
                    return None;
                };
                match open(*format, self.source.as_mut()) {
                    Ok(records) => self.current = Some(records),
                    Err(e) => {
                        debug!(source = %self.label, ?format, error = %e, "decoder rejected source");
                    }
                }
                continue;
            };

            match records.next() {
                Some(Ok(decoded)) => return Some(Ok(decoded)),
                Some(Err(e)) => {
                    debug!(source = %self.label, error = %e, "decoder failed, trying the next one");
                    self.current = None;
                }
                // the successful decoder stays current so later decoders are never tried
                None => return None,
            }
        }
    }
}
