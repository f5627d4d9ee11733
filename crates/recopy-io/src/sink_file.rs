use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use apache_avro::types::Value as AvroValue;
use apache_avro::{Codec, Schema, Writer};
use async_trait::async_trait;
use recopy_core::{Record, RecopyError, RecordWriter};
use recopy_tx::{encode_json_line, restore_bytes};
use tracing::info;

use crate::conform::Conformer;

/// Compression used for every Avro container written.
pub const AVRO_CODEC: Codec = Codec::Deflate;

/// Shapes a record under the working schema, turning data URIs back into
/// bytes first.
pub(crate) fn avro_datum(record: &Record, conformer: &Conformer<'_>) -> Result<AvroValue> {
    conformer.conform(&restore_bytes(record.clone()))
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Line-delimited JSON file; bytes are written as data URIs.
pub struct JsonFileWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
}

impl JsonFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            out: Some(create(path)?),
        })
    }
}

#[async_trait]
impl RecordWriter for JsonFileWriter {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let out = self.out.as_mut().context("json writer is closed")?;
        let mut line = encode_json_line(record)?;
        line.push(b'\n');
        out.write_all(&line)
            .with_context(|| format!("write {}", self.path.display()))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush().with_context(|| format!("flush {}", self.path.display()))?;
            info!(path = %self.path.display(), "json file closed");
        }
        Ok(())
    }
}

enum AvroState<'s> {
    Open(Writer<'s, BufWriter<File>>, Conformer<'s>),
    /// No schema was resolved; the first write fails
    NoSchema,
    Closed,
}

/// Deflate-compressed Avro container file with the working schema in its header.
pub struct AvroFileWriter<'s> {
    path: PathBuf,
    state: AvroState<'s>,
}

impl<'s> AvroFileWriter<'s> {
    pub fn create(path: &Path, schema: Option<&'s Schema>) -> Result<Self> {
        let out = create(path)?;
        let state = match schema {
            Some(schema) => AvroState::Open(Writer::with_codec(schema, out, AVRO_CODEC), Conformer::new(schema)?),
            None => AvroState::NoSchema,
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }
}

#[async_trait]
impl<'s> RecordWriter for AvroFileWriter<'s> {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let (writer, conformer) = match &mut self.state {
            AvroState::Open(writer, conformer) => (writer, &*conformer),
            AvroState::NoSchema => return Err(RecopyError::MissingSchema.into()),
            AvroState::Closed => anyhow::bail!("avro writer is closed"),
        };
        let datum = avro_datum(record, conformer)?;
        writer
            .append(datum)
            .with_context(|| format!("write {}", self.path.display()))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let AvroState::Open(writer, _) = std::mem::replace(&mut self.state, AvroState::Closed) {
            let mut out = writer
                .into_inner()
                .with_context(|| format!("finish {}", self.path.display()))?;
            out.flush().with_context(|| format!("flush {}", self.path.display()))?;
            info!(path = %self.path.display(), "avro file closed");
        }
        Ok(())
    }
}
