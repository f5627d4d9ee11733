//! Typed source and destination descriptors.
//!
//! Command line arguments are either file paths (possibly globs) or broker
//! URLs of the form
//! `kafka://[group@]broker[,broker...]/topicPattern[,topicPattern...]`.

use std::path::PathBuf;

use anyhow::Context;
use glob::glob;
use regex::Regex;
use tracing::{debug, warn};

use crate::RecopyError;

/// URL scheme marking a broker source or destination.
pub const BROKER_SCHEME: &str = "kafka://";

const GLOB_CHARS: &[char] = &['*', '?', '['];

/// One resolved input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    File { path: PathBuf },
    Broker(BrokerDescriptor),
}

/// Consumer-side view of a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerDescriptor {
    /// Explicit consumer group; `None` means an ephemeral, non-committing group
    pub consumer_group: Option<String>,
    pub brokers: Vec<String>,
    /// Regular expressions matched against topic names
    pub topic_patterns: Vec<String>,
}

impl BrokerDescriptor {
    /// Parses a `kafka://` URL and validates every topic pattern.
    pub fn parse(url: &str) -> Result<Self, RecopyError> {
        let (group, brokers, topics) = split_url(url)?;
        for pattern in &topics {
            Regex::new(pattern).map_err(|source| RecopyError::InvalidTopicPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        Ok(Self {
            consumer_group: group,
            brokers,
            topic_patterns: topics,
        })
    }

    /// Comma-joined broker list as librdkafka expects it.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Reconstructs a broker URL scoped to one concrete topic.
    pub fn identity(&self, topic: &str) -> String {
        match &self.consumer_group {
            Some(group) => format!("{BROKER_SCHEME}{group}@{}/{topic}", self.bootstrap_servers()),
            None => format!("{BROKER_SCHEME}{}/{topic}", self.bootstrap_servers()),
        }
    }
}

/// Where records are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterTarget {
    File { path: PathBuf },
    Broker { brokers: Vec<String>, topic: String },
}

/// Returns true when the argument uses the broker URL scheme.
pub fn is_broker_url(raw: &str) -> bool {
    raw.starts_with(BROKER_SCHEME)
}

/// Resolves raw source arguments, in order, into descriptors.
///
/// Paths containing glob characters expand to zero or more files in
/// traversal order. At most one broker URL is accepted and it must come last,
/// so bounded file sources are always drained before the unbounded broker read.
pub fn resolve_sources<I, S>(raw: I) -> Result<Vec<SourceDescriptor>, RecopyError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sources = Vec::new();
    let mut seen_broker = false;

    for arg in raw {
        let arg = arg.as_ref();
        if seen_broker {
            return Err(if is_broker_url(arg) {
                RecopyError::MultipleBrokerSources
            } else {
                RecopyError::BrokerSourceNotLast
            });
        }

        if is_broker_url(arg) {
            seen_broker = true;
            sources.push(SourceDescriptor::Broker(BrokerDescriptor::parse(arg)?));
        } else if arg.contains(GLOB_CHARS) {
            let matches = glob(arg).with_context(|| format!("bad glob pattern {arg}"))?;
            let before = sources.len();
            for entry in matches {
                let path = entry.with_context(|| format!("glob {arg}"))?;
                sources.push(SourceDescriptor::File { path });
            }
            if sources.len() == before {
                warn!(pattern = arg, "glob matched no files");
            }
        } else {
            sources.push(SourceDescriptor::File { path: PathBuf::from(arg) });
        }
    }

    debug!(count = sources.len(), "resolved sources");
    Ok(sources)
}

/// Resolves the destination argument.
///
/// A broker destination names exactly one topic; a consumer group prefix has
/// no meaning there and is ignored.
pub fn resolve_target(raw: &str) -> Result<WriterTarget, RecopyError> {
    if !is_broker_url(raw) {
        return Ok(WriterTarget::File { path: PathBuf::from(raw) });
    }

    let (group, brokers, mut topics) = split_url(raw)?;
    if group.is_some() {
        warn!(url = raw, "consumer group is ignored on a broker destination");
    }
    if topics.len() != 1 {
        return Err(RecopyError::InvalidBrokerUrl {
            url: raw.to_string(),
            reason: "a destination must name exactly one topic",
        });
    }
    Ok(WriterTarget::Broker {
        brokers,
        topic: topics.remove(0),
    })
}

type UrlParts = (Option<String>, Vec<String>, Vec<String>);

fn split_url(url: &str) -> Result<UrlParts, RecopyError> {
    let invalid = |reason| RecopyError::InvalidBrokerUrl {
        url: url.to_string(),
        reason,
    };

    let rest = url.strip_prefix(BROKER_SCHEME).ok_or_else(|| invalid("missing kafka:// scheme"))?;
    let (authority, topics) = rest.split_once('/').ok_or_else(|| invalid("missing topic"))?;
    let (group, brokers) = match authority.split_once('@') {
        Some(("", _)) => return Err(invalid("empty consumer group")),
        Some((group, brokers)) => (Some(group.to_string()), brokers),
        None => (None, authority),
    };

    let brokers = split_list(brokers).ok_or_else(|| invalid("empty broker"))?;
    let topics = split_list(topics).ok_or_else(|| invalid("empty topic"))?;
    Ok((group, brokers, topics))
}

fn split_list(raw: &str) -> Option<Vec<String>> {
    let items: Vec<String> = raw.split(',').map(str::to_string).collect();
    if items.iter().any(String::is_empty) {
        return None;
    }
    Some(items)
}
