//! One lazy record stream over every source, in argument order.

use std::collections::VecDeque;
use std::fs::File;

use anyhow::{Context, Result};
use async_trait::async_trait;
use recopy_core::{BrokerDescriptor, InputFormat, RecordMetadata, RecordStream, SourceDescriptor, StreamItem};
use tracing::{debug, info};

use crate::client::ClientProps;
use crate::decode::{decode, Decoded, Records};
use crate::source_kafka::ConsumerSession;

/// Chains the decoders of all sources into one [`RecordStream`].
///
/// At most one source is open at a time. Moving past a source, or closing the
/// multiplexer, releases it: file handles are dropped and a consumer session
/// is closed with its final commit.
pub struct Multiplexer {
    pending: VecDeque<SourceDescriptor>,
    input: InputFormat,
    props: ClientProps,
    current: Option<OpenSource>,
}

enum OpenSource {
    File {
        identity: String,
        records: Records,
    },
    Broker {
        descriptor: BrokerDescriptor,
        session: ConsumerSession,
        /// Records of the message being drained, with its identity
        message: Option<(String, Records)>,
    },
}

impl Multiplexer {
    pub fn new(sources: Vec<SourceDescriptor>, input: InputFormat, props: ClientProps) -> Self {
        Self {
            pending: sources.into(),
            input,
            props,
            current: None,
        }
    }

    fn open(&self, source: SourceDescriptor) -> Result<OpenSource> {
        match source {
            SourceDescriptor::File { path } => {
                let identity = path.display().to_string();
                let file = File::open(&path).with_context(|| format!("open {identity}"))?;
                info!(source = %identity, "reading file");
                let records = decode(self.input, Box::new(file), &identity)
                    .with_context(|| format!("decode {identity}"))?;
                Ok(OpenSource::File { identity, records })
            }
            SourceDescriptor::Broker(descriptor) => {
                let session = ConsumerSession::open(&descriptor, &self.props)?;
                Ok(OpenSource::Broker {
                    descriptor,
                    session,
                    message: None,
                })
            }
        }
    }
}

fn item(decoded: Decoded, identity: &str) -> StreamItem {
    StreamItem {
        record: decoded.record,
        meta: RecordMetadata {
            schema: decoded.schema,
            source: identity.to_string(),
        },
    }
}

#[async_trait]
impl RecordStream for Multiplexer {
    async fn next_item(&mut self) -> Result<Option<StreamItem>> {
        loop {
            let Some(open) = self.current.as_mut() else {
                match self.pending.pop_front() {
                    Some(source) => self.current = Some(self.open(source)?),
                    None => return Ok(None),
                }
                continue;
            };

            match open {
                OpenSource::File { identity, records } => match records.next() {
                    Some(decoded) => {
                        let decoded = decoded.with_context(|| format!("decode {identity}"))?;
                        return Ok(Some(item(decoded, identity)));
                    }
                    None => {
                        debug!(source = %identity, "file exhausted");
                        self.current = None;
                    }
                },
                OpenSource::Broker {
                    descriptor,
                    session,
                    message,
                } => {
                    if let Some((identity, records)) = message {
                        if let Some(decoded) = records.next() {
                            let decoded = decoded.with_context(|| format!("decode message from {identity}"))?;
                            return Ok(Some(item(decoded, identity)));
                        }
                    }

                    let raw = session.next_message().await?;
                    let identity = descriptor.identity(&raw.topic);
                    let records = decode(self.input, Box::new(raw.payload), &identity)
                        .with_context(|| format!("decode message from {identity}"))?;
                    *message = Some((identity, records));
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.pending.clear();
        match self.current.take() {
            Some(OpenSource::Broker { mut session, .. }) => session.close(),
            Some(OpenSource::File { identity, .. }) => {
                debug!(source = %identity, "file closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recopy_core::{Format, Record};
    use std::path::{Path, PathBuf};

    fn file(dir: &Path, name: &str, contents: &str) -> SourceDescriptor {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        SourceDescriptor::File { path }
    }

    async fn drain(mux: &mut Multiplexer) -> Vec<StreamItem> {
        let mut out = Vec::new();
        while let Some(item) = mux.next_item().await.unwrap() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn files_are_chained_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![
            file(dir.path(), "one.json", "{\"a\": 1}"),
            file(dir.path(), "two.jsonl", "{\"a\": 2}\n{\"a\": 3}\n"),
        ];
        let mut mux = Multiplexer::new(sources, InputFormat::Auto, ClientProps::default());

        let items = drain(&mut mux).await;
        let values: Vec<_> = items.iter().map(|i| i.record.get("a").cloned().unwrap()).collect();
        assert_eq!(values, vec![Record::Int(1), Record::Int(2), Record::Int(3)]);
        assert!(items[0].meta.source.ends_with("one.json"));
        assert!(items[2].meta.source.ends_with("two.jsonl"));
        assert!(items.iter().all(|i| i.meta.schema.is_none()));

        // exhausted streams stay exhausted
        assert!(mux.next_item().await.unwrap().is_none());
        mux.close().unwrap();
    }

    #[tokio::test]
    async fn empty_source_list_yields_nothing() {
        let mut mux = Multiplexer::new(vec![], InputFormat::Auto, ClientProps::default());
        assert!(mux.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let sources = vec![SourceDescriptor::File {
            path: PathBuf::from("/definitely/not/here.json"),
        }];
        let mut mux = Multiplexer::new(sources, InputFormat::Auto, ClientProps::default());
        let err = mux.next_item().await.unwrap_err();
        assert!(err.to_string().contains("here.json"));
    }

    #[tokio::test]
    async fn explicit_format_errors_name_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![file(dir.path(), "bad.json", "{\"a\": 1}\nnope\n")];
        let mut mux = Multiplexer::new(sources, InputFormat::Exactly(Format::Json), ClientProps::default());
        assert!(mux.next_item().await.unwrap().is_some());
        let err = mux.next_item().await.unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"));
    }

    #[tokio::test]
    async fn unreadable_container_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![file(dir.path(), "rows.avro", "{\"a\": 1}")];
        let mut mux = Multiplexer::new(sources, InputFormat::Exactly(Format::Avro), ClientProps::default());
        let err = mux.next_item().await.unwrap_err();
        assert!(format!("{err:#}").contains("decode"));
        assert!(format!("{err:#}").contains("rows.avro"));
    }

    #[tokio::test]
    async fn close_mid_stream_stops_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![
            file(dir.path(), "a.jsonl", "{\"a\": 1}\n{\"a\": 2}\n"),
            file(dir.path(), "b.jsonl", "{\"a\": 3}\n"),
        ];
        let mut mux = Multiplexer::new(sources, InputFormat::Auto, ClientProps::default());
        assert!(mux.next_item().await.unwrap().is_some());

        mux.close().unwrap();
        mux.close().unwrap();
        assert!(mux.next_item().await.unwrap().is_none());
    }
}
