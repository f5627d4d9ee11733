//! Extra librdkafka properties shared by every consumer and producer.
//!
//! Properties come from an optional TOML/YAML/JSON file and from
//! `RECOPY_KAFKA_*` environment variables, where `__` stands for `.`
//! (`RECOPY_KAFKA_SECURITY__PROTOCOL=SSL` sets `security.protocol`).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, Value};
use rdkafka::ClientConfig;
use tracing::debug;

/// Flat map of librdkafka property names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientProps {
    props: BTreeMap<String, String>,
}

impl ClientProps {
    /// Loads properties from `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("RECOPY_KAFKA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("load kafka client properties")?;

        let table: BTreeMap<String, Value> = settings
            .try_deserialize()
            .context("kafka client properties must be a table")?;

        let mut props = BTreeMap::new();
        for (key, value) in table {
            flatten(key, value, &mut props)?;
        }
        debug!(count = props.len(), "loaded kafka client properties");
        Ok(Self { props })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Copies every property onto a client configuration.
    pub fn apply(&self, config: &mut ClientConfig) {
        for (key, value) in &self.props {
            config.set(key, value);
        }
    }
}

fn flatten(key: String, value: Value, out: &mut BTreeMap<String, String>) -> Result<()> {
    match value.clone().into_table() {
        Ok(table) => {
            for (child, value) in table {
                flatten(format!("{key}.{child}"), value, out)?;
            }
        }
        Err(_) => {
            let text = value
                .into_string()
                .with_context(|| format!("kafka property {key} is not a scalar"))?;
            out.insert(key, text);
        }
    }
    Ok(())
}
