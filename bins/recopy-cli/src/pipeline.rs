//! Copy orchestration: schema resolution, the write loop, and teardown.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use recopy_core::{
    Format, InputFormat, RecopyError, RecordStream, RecordWriter, SourceDescriptor, WriterTarget,
};
use recopy_io::{open_writer, resolve_schema, save_schema, ClientProps, Multiplexer, PushBack};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::Progress;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub input: InputFormat,
    pub output: Format,
    /// Explicit schema file, used for every write
    pub schema: Option<PathBuf>,
    /// Where to export the working schema once it is known
    pub save_schema: Option<PathBuf>,
    /// Maximum number of records written
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { written: u64 },
    Cancelled { written: u64 },
}

/// Output format: the explicit one, else the destination file's extension.
pub fn output_format(explicit: Option<Format>, target: &WriterTarget) -> Result<Format, RecopyError> {
    if let Some(format) = explicit {
        return Ok(format);
    }
    match target {
        WriterTarget::File { path } => {
            Format::from_path(path).ok_or_else(|| RecopyError::UnknownOutputFormat(path.display().to_string()))
        }
        WriterTarget::Broker { topic, .. } => Err(RecopyError::UnknownOutputFormat(topic.clone())),
    }
}

/// Runs one copy session from `sources` to `target`.
pub async fn run<W: Write>(
    sources: Vec<SourceDescriptor>,
    target: &WriterTarget,
    options: &CopyOptions,
    props: &ClientProps,
    progress: Progress<W>,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let mut stream = PushBack::new(Multiplexer::new(sources, options.input, props.clone()));

    let resolved = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        schema = resolve_schema(options.schema.as_deref(), &mut stream) => Some(schema),
    };
    let schema = match resolved {
        Some(Ok(schema)) => schema,
        Some(Err(e)) => return Err(release(&mut stream, e)),
        None => {
            stream.close()?;
            info!("cancelled before the first record");
            return Ok(Outcome::Cancelled { written: 0 });
        }
    };

    // known once a file was given or a first item is waiting; the record
    // limit does not delay it
    if let Some(path) = &options.save_schema {
        if options.schema.is_some() || stream.is_primed() {
            if let Err(e) = save_schema(path, schema.as_ref()) {
                return Err(release(&mut stream, e));
            }
        } else {
            debug!("input is empty, schema not exported");
        }
    }

    let writer = match open_writer(target, options.output, schema.as_deref(), props) {
        Ok(writer) => writer,
        Err(e) => return Err(release(&mut stream, e)),
    };

    drive(&mut stream, writer, progress, options, cancel).await
}

fn release<S: RecordStream>(stream: &mut S, error: anyhow::Error) -> anyhow::Error {
    if let Err(e) = stream.close() {
        warn!(error = %e, "closing sources failed");
    }
    error
}

/// Copies items from `stream` into `writer`, then tears everything down.
///
/// Teardown runs on every exit path, innermost first: progress summary,
/// writer, then the stream.
pub async fn drive<S, W>(
    stream: &mut S,
    mut writer: Box<dyn RecordWriter + '_>,
    mut progress: Progress<W>,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<Outcome>
where
    S: RecordStream,
    W: Write,
{
    let result = copy(stream, writer.as_mut(), &mut progress, options, cancel).await;

    let teardown = [
        ("progress", progress.finish().map_err(anyhow::Error::from)),
        ("writer", writer.close()),
        ("sources", stream.close()),
    ];

    match result {
        Ok(outcome) => {
            for (what, closed) in teardown {
                closed.with_context(|| format!("close {what}"))?;
            }
            Ok(outcome)
        }
        Err(e) => {
            for (what, closed) in teardown {
                if let Err(err) = closed {
                    warn!(error = %err, "closing {what} failed");
                }
            }
            Err(e)
        }
    }
}

async fn copy<S, W>(
    stream: &mut S,
    writer: &mut (dyn RecordWriter + '_),
    progress: &mut Progress<W>,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<Outcome>
where
    S: RecordStream,
    W: Write,
{
    let mut written = 0u64;

    loop {
        if options.count.is_some_and(|limit| written >= limit) {
            debug!(written, "record limit reached");
            return Ok(Outcome::Completed { written });
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = stream.next_item() => Some(item),
        };
        let Some(item) = next else {
            info!(written, "cancelled");
            return Ok(Outcome::Cancelled { written });
        };
        let Some(item) = item? else {
            info!(written, "all sources exhausted");
            return Ok(Outcome::Completed { written });
        };

        // never raced against cancellation: a started write always completes
        writer
            .write(&item.record)
            .await
            .with_context(|| format!("write record from {}", item.meta.source))?;
        written += 1;

        progress.record(written, &item.meta.source)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::types::Value as AvroValue;
    use apache_avro::{Codec, Decimal, Schema};
    use async_trait::async_trait;
    use recopy_core::{Record, RecordMetadata, StreamItem};
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        writes: AtomicUsize,
        writer_closed: AtomicBool,
        stream_closed: AtomicBool,
        pulled: AtomicUsize,
    }

    struct CountingWriter(Arc<Counters>);

    #[async_trait]
    impl RecordWriter for CountingWriter {
        async fn write(&mut self, _record: &Record) -> Result<()> {
            self.0.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.0.writer_closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Items(VecDeque<StreamItem>, Arc<Counters>);

    #[async_trait]
    impl RecordStream for Items {
        async fn next_item(&mut self) -> Result<Option<StreamItem>> {
            self.1.pulled.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.pop_front())
        }

        fn close(&mut self) -> Result<()> {
            self.1.stream_closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn defaults() -> CopyOptions {
        CopyOptions {
            input: InputFormat::Auto,
            output: Format::Json,
            schema: None,
            save_schema: None,
            count: None,
        }
    }

    fn items(n: usize, counters: &Arc<Counters>) -> Items {
        let items = (0..n)
            .map(|i| StreamItem {
                record: Record::Int(i as i64),
                meta: RecordMetadata {
                    schema: None,
                    source: format!("src{}", i % 2),
                },
            })
            .collect();
        Items(items, counters.clone())
    }

    async fn drive_counted(n: usize, count: Option<u64>) -> (Outcome, Arc<Counters>, String) {
        let counters = Arc::new(Counters::default());
        let mut stream = items(n, &counters);
        let options = CopyOptions {
            count,
            ..defaults()
        };
        let mut out = Vec::new();
        let outcome = drive(
            &mut stream,
            Box::new(CountingWriter(counters.clone())),
            Progress::new(&mut out),
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        (outcome, counters, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn count_limits_writer_invocations() {
        for (available, limit, expected) in [(5, Some(3), 3), (5, Some(9), 5), (5, None, 5), (0, Some(2), 0)] {
            let (outcome, counters, _) = drive_counted(available, limit).await;
            assert_eq!(outcome, Outcome::Completed { written: expected as u64 });
            assert_eq!(counters.writes.load(Ordering::SeqCst), expected);
            assert!(counters.writer_closed.load(Ordering::SeqCst));
            assert!(counters.stream_closed.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn count_zero_still_opens_and_closes_everything() {
        let (outcome, counters, progress) = drive_counted(4, Some(0)).await;
        assert_eq!(outcome, Outcome::Completed { written: 0 });
        assert_eq!(counters.writes.load(Ordering::SeqCst), 0);
        assert_eq!(counters.pulled.load(Ordering::SeqCst), 0);
        assert!(counters.writer_closed.load(Ordering::SeqCst));
        assert_eq!(progress, "0 sources:\n");
    }

    #[tokio::test]
    async fn progress_sees_every_written_record() {
        let (_, _, progress) = drive_counted(3, None).await;
        assert!(progress.starts_with("010"));
        assert!(progress.contains("2 sources:\n  0 src0\n  1 src1\n"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_and_still_tears_down() {
        let counters = Arc::new(Counters::default());
        let mut stream = items(10, &counters);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = drive(
            &mut stream,
            Box::new(CountingWriter(counters.clone())),
            Progress::<Vec<u8>>::disabled(),
            &defaults(),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Cancelled { written: 0 });
        assert_eq!(counters.writes.load(Ordering::SeqCst), 0);
        assert!(counters.writer_closed.load(Ordering::SeqCst));
        assert!(counters.stream_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_write_still_closes_writer() {
        struct FailingWriter(Arc<Counters>);

        #[async_trait]
        impl RecordWriter for FailingWriter {
            async fn write(&mut self, _record: &Record) -> Result<()> {
                anyhow::bail!("disk full")
            }

            fn close(&mut self) -> Result<()> {
                self.0.writer_closed.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let counters = Arc::new(Counters::default());
        let mut stream = items(2, &counters);
        let err = drive(
            &mut stream,
            Box::new(FailingWriter(counters.clone())),
            Progress::<Vec<u8>>::disabled(),
            &defaults(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("disk full"));
        assert!(counters.writer_closed.load(Ordering::SeqCst));
        assert!(counters.stream_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_during_a_write_finishes_that_write_only() {
        struct CancellingWriter(Arc<Counters>, CancellationToken);

        #[async_trait]
        impl RecordWriter for CancellingWriter {
            async fn write(&mut self, _record: &Record) -> Result<()> {
                self.1.cancel();
                self.0.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn close(&mut self) -> Result<()> {
                self.0.writer_closed.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let counters = Arc::new(Counters::default());
        let mut stream = items(5, &counters);
        let cancel = CancellationToken::new();

        let outcome = drive(
            &mut stream,
            Box::new(CancellingWriter(counters.clone(), cancel.clone())),
            Progress::<Vec<u8>>::disabled(),
            &defaults(),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Cancelled { written: 1 });
        assert_eq!(counters.writes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.pulled.load(Ordering::SeqCst), 1);
        assert!(counters.writer_closed.load(Ordering::SeqCst));
        assert!(counters.stream_closed.load(Ordering::SeqCst));
    }

    #[test]
    fn output_format_resolution() {
        let file = |p: &str| WriterTarget::File { path: PathBuf::from(p) };
        let topic = WriterTarget::Broker {
            brokers: vec!["h".into()],
            topic: "t".into(),
        };

        assert_eq!(output_format(None, &file("o.jsonl")).unwrap(), Format::Json);
        assert_eq!(output_format(None, &file("o.avro")).unwrap(), Format::Avro);
        assert_eq!(output_format(Some(Format::Avro), &topic).unwrap(), Format::Avro);
        assert!(matches!(
            output_format(None, &file("o.txt")),
            Err(RecopyError::UnknownOutputFormat(_))
        ));
        assert!(matches!(
            output_format(None, &topic),
            Err(RecopyError::UnknownOutputFormat(_))
        ));
    }

    // End-to-end through the real multiplexer and writers.

    const SCHEMA: &str = r#"{"type":"record","name":"row","fields":[
        {"name":"id","type":"long"},
        {"name":"blob","type":"bytes"}
    ]}"#;

    fn write_avro(path: &Path, ids: &[i64]) {
        let schema = Schema::parse_str(SCHEMA).unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut writer = apache_avro::Writer::with_codec(&schema, file, Codec::Deflate);
        for id in ids {
            writer
                .append(AvroValue::Record(vec![
                    ("id".into(), AvroValue::Long(*id)),
                    ("blob".into(), AvroValue::Bytes(vec![*id as u8, 0xff])),
                ]))
                .unwrap();
        }
        writer.into_inner().unwrap();
    }

    async fn copy_files(sources: Vec<PathBuf>, dest: &Path, mut options: CopyOptions) -> Result<Outcome> {
        let sources = sources.into_iter().map(|path| SourceDescriptor::File { path }).collect();
        let target = WriterTarget::File { path: dest.to_path_buf() };
        options.output = output_format(None, &target)?;
        run(
            sources,
            &target,
            &options,
            &ClientProps::default(),
            Progress::<Vec<u8>>::disabled(),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn two_json_files_become_two_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, "{\"a\":1}").unwrap();
        std::fs::write(&b, "{\"a\":2}").unwrap();
        let dest = dir.path().join("out.json");

        let outcome = copy_files(vec![a, b], &dest, defaults()).await.unwrap();
        assert_eq!(outcome, Outcome::Completed { written: 2 });
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "{\"a\": 1}\n{\"a\": 2}\n");
    }

    #[tokio::test]
    async fn avro_to_json_to_avro_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.avro");
        write_avro(&source, &[1, 2, 3]);

        let json = dir.path().join("mid.jsonl");
        let saved = dir.path().join("schema.avsc");
        let options = CopyOptions {
            save_schema: Some(saved.clone()),
            ..defaults()
        };
        copy_files(vec![source], &json, options).await.unwrap();

        let text = std::fs::read_to_string(&json).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(first["blob"], "data:application/octet-stream;base64,Af8=");

        // JSON carries no schema, so going back to avro needs the saved one
        let back = dir.path().join("out.avro");
        let options = CopyOptions {
            schema: Some(saved),
            ..defaults()
        };
        let outcome = copy_files(vec![json], &back, options).await.unwrap();
        assert_eq!(outcome, Outcome::Completed { written: 3 });

        let reader = apache_avro::Reader::new(std::fs::File::open(&back).unwrap()).unwrap();
        let rows: Vec<Record> = reader.map(|v| Record::from(v.unwrap())).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get("id"), Some(&Record::Int(3)));
        assert_eq!(rows[2].get("blob"), Some(&Record::Bytes(vec![3, 0xff])));
    }

    #[tokio::test]
    async fn avro_logical_types_survive_an_avro_copy() {
        let schema = Schema::parse_str(
            r#"{"type":"record","name":"event","fields":[
                {"name":"day","type":{"type":"int","logicalType":"date"}},
                {"name":"at","type":{"type":"int","logicalType":"time-millis"}},
                {"name":"price","type":{"type":"bytes","logicalType":"decimal","precision":6,"scale":2}}
            ]}"#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.avro");
        let mut writer = apache_avro::Writer::with_codec(&schema, std::fs::File::create(&source).unwrap(), Codec::Deflate);
        writer
            .append(AvroValue::Record(vec![
                ("day".into(), AvroValue::Date(19000)),
                ("at".into(), AvroValue::TimeMillis(3_600_000)),
                ("price".into(), AvroValue::Decimal(Decimal::from(vec![0x04, 0xd2]))),
            ]))
            .unwrap();
        writer.into_inner().unwrap();

        let dest = dir.path().join("out.avro");
        let outcome = copy_files(vec![source], &dest, defaults()).await.unwrap();
        assert_eq!(outcome, Outcome::Completed { written: 1 });

        let reader = apache_avro::Reader::new(std::fs::File::open(&dest).unwrap()).unwrap();
        assert_eq!(reader.writer_schema(), &schema);
        let rows: Vec<Record> = reader.map(|v| Record::from(v.unwrap())).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("day"), Some(&Record::Int(19000)));
        assert_eq!(rows[0].get("at"), Some(&Record::Int(3_600_000)));
        assert_eq!(rows[0].get("price"), Some(&Record::Bytes(vec![0x04, 0xd2])));
    }

    #[tokio::test]
    async fn schema_is_exported_even_when_nothing_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let avro = dir.path().join("in.avro");
        write_avro(&avro, &[1]);
        let json = dir.path().join("in.json");
        std::fs::write(&json, "{\"a\": 1}").unwrap();
        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "").unwrap();

        let export = |name: &str| CopyOptions {
            save_schema: Some(dir.path().join(name)),
            count: Some(0),
            ..defaults()
        };

        let outcome = copy_files(vec![avro], &dir.path().join("a.jsonl"), export("a.avsc"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Completed { written: 0 });
        let saved = std::fs::read_to_string(dir.path().join("a.avsc")).unwrap();
        assert_eq!(Schema::parse_str(&saved).unwrap(), Schema::parse_str(SCHEMA).unwrap());

        copy_files(vec![json], &dir.path().join("b.jsonl"), export("b.avsc"))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("b.avsc")).unwrap(), "null");

        copy_files(vec![empty], &dir.path().join("c.jsonl"), export("c.avsc"))
            .await
            .unwrap();
        assert!(!dir.path().join("c.avsc").exists());
    }

    #[tokio::test]
    async fn avro_output_without_any_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.json");
        std::fs::write(&source, "{\"a\": 1}").unwrap();

        let err = copy_files(vec![source], &dir.path().join("out.avro"), defaults())
            .await
            .unwrap_err();
        assert!(err.chain().any(|e| matches!(e.downcast_ref::<RecopyError>(), Some(RecopyError::MissingSchema))));
    }

    #[tokio::test]
    async fn empty_input_to_avro_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.json");
        std::fs::write(&source, "").unwrap();

        let outcome = copy_files(vec![source], &dir.path().join("out.avro"), defaults())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Completed { written: 0 });
    }
}
