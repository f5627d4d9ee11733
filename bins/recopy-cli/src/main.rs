use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use recopy_core::descriptor::{resolve_sources, resolve_target};
use recopy_core::{Format, InputFormat};
use recopy_io::ClientProps;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod pipeline;
mod progress;

use pipeline::{output_format, CopyOptions, Outcome};
use progress::Progress;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Avro,
}

impl From<FormatArg> for Format {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => Format::Json,
            FormatArg::Avro => Format::Avro,
        }
    }
}

/// Copy records between JSON/Avro files and Kafka topics.
///
/// Sources are files, glob patterns, or one trailing
/// `kafka://[group@]host[,host]/topic[,topic]` URL. The destination is a file
/// or a `kafka://host/topic` URL.
#[derive(Parser, Debug)]
#[command(name = "recopy", version)]
struct Args {
    /// Sources followed by the destination
    #[arg(required = true, num_args = 2.., value_name = "SOURCES... DEST")]
    paths: Vec<String>,
    /// Input format; autodetected per source when omitted
    #[arg(long, value_enum)]
    from: Option<FormatArg>,
    /// Output format; inferred from the destination extension when omitted
    #[arg(long, value_enum)]
    to: Option<FormatArg>,
    /// Avro schema file used for every write
    #[arg(long)]
    schema: Option<PathBuf>,
    /// Export the working schema to this file
    #[arg(long)]
    save_schema: Option<PathBuf>,
    /// Stop after writing this many records
    #[arg(long)]
    count: Option<u64>,
    /// Print a per-record progress display on stderr
    #[arg(long)]
    progress: bool,
    /// Extra librdkafka properties (TOML, YAML or JSON file)
    #[arg(long, env = "RECOPY_CLIENT_CONFIG")]
    client_config: Option<PathBuf>,
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(args.verbose)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Everything that can be rejected is checked before any I/O starts.
    let (dest, sources) = args
        .paths
        .split_last()
        .context("a destination is required")?;
    let sources = resolve_sources(sources)?;
    let target = resolve_target(dest)?;
    let output = output_format(args.to.map(Format::from), &target)?;
    let input = args
        .from
        .map_or(InputFormat::Auto, |f| InputFormat::Exactly(f.into()));
    let props = ClientProps::load(args.client_config.as_deref())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, finishing the current record");
                on_signal.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    let options = CopyOptions {
        input,
        output,
        schema: args.schema,
        save_schema: args.save_schema,
        count: args.count,
    };
    let outcome = pipeline::run(
        sources,
        &target,
        &options,
        &props,
        Progress::stderr(args.progress),
        &cancel,
    )
    .await?;

    match outcome {
        Outcome::Completed { written } => info!(written, "copy complete"),
        Outcome::Cancelled { written } => info!(written, "copy interrupted"),
    }
    Ok(())
}
