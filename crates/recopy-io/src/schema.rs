//! Working-schema resolution.
//!
//! One schema is fixed before the first write: the `--schema` file when given,
//! otherwise the schema of the first streamed item. Peeking that item must not
//! lose it, so the stream is wrapped in [`PushBack`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use apache_avro::Schema;
use async_trait::async_trait;
use recopy_core::{RecordStream, SchemaRef, StreamItem};
use tracing::{debug, info};

/// A stream with room for one item pushed back to its front.
pub struct PushBack<S> {
    head: Option<StreamItem>,
    inner: S,
}

impl<S> PushBack<S> {
    pub fn new(inner: S) -> Self {
        Self { head: None, inner }
    }

    /// Makes `item` the next one yielded.
    pub fn push_back(&mut self, item: StreamItem) {
        debug_assert!(self.head.is_none(), "only one item can be pushed back");
        self.head = Some(item);
    }

    /// Whether an item is waiting at the front.
    pub fn is_primed(&self) -> bool {
        self.head.is_some()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: RecordStream> RecordStream for PushBack<S> {
    async fn next_item(&mut self) -> Result<Option<StreamItem>> {
        match self.head.take() {
            Some(item) => Ok(Some(item)),
            None => self.inner.next_item().await,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.head = None;
        self.inner.close()
    }
}

/// Parses a JSON-encoded Avro schema file.
pub fn load_schema(path: &Path) -> Result<SchemaRef> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read schema {}", path.display()))?;
    let schema = Schema::parse_str(&text).with_context(|| format!("parse schema {}", path.display()))?;
    Ok(Arc::new(schema))
}

/// Writes the working schema as JSON; an absent schema is written as `null`.
pub fn save_schema(path: &Path, schema: Option<&SchemaRef>) -> Result<()> {
    let text = match schema {
        Some(schema) => serde_json::to_string_pretty(schema.as_ref())?,
        None => "null".to_string(),
    };
    std::fs::write(path, text).with_context(|| format!("write schema {}", path.display()))?;
    info!(path = %path.display(), "saved schema");
    Ok(())
}

/// Determines the schema used for the whole session.
///
/// With an explicit schema file the stream is not touched. Otherwise one item
/// is pulled and pushed back; its schema (possibly none) becomes the working
/// schema. An empty stream resolves to no schema.
pub async fn resolve_schema<S: RecordStream>(
    explicit: Option<&Path>,
    stream: &mut PushBack<S>,
) -> Result<Option<SchemaRef>> {
    if let Some(path) = explicit {
        return load_schema(path).map(Some);
    }

    match stream.next_item().await? {
        Some(item) => {
            let schema = item.meta.schema.clone();
            debug!(source = %item.meta.source, found = schema.is_some(), "schema taken from first record");
            stream.push_back(item);
            Ok(schema)
        }
        None => {
            debug!("input is empty, no schema");
            Ok(None)
        }
    }
}
