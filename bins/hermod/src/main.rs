//! # Hermod CLI — pipeline runner
//!
//! Loads a YAML [`hermod_core::config::PipelineSpec`] describing one source
//! and one or more sinks, builds the concrete `Source`/`Sink` instances it
//! names, and runs them through [`hermod_engine::Engine`] until `Ctrl-C`.
//!
//! Reworked from the teacher's `bins/rde-cli/src/main.rs`: that CLI wired
//! an operator graph of `source -> transform* -> sink` tasks connected by
//! raw `mpsc` channels it built by hand per pipeline shape. Hermod's
//! Source/Sink contract has no transform stage and a fixed pump shape
//! (`Engine` owns the batching/retry/ack loop), so this binary only needs
//! to parse the spec, build the two trait objects, and hand them to the
//! engine — the channel wiring `rde-cli` did inline now lives inside
//! `hermod_engine::engine::Engine::run`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hermod_core::config::PipelineSpec;
use hermod_engine::Engine;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Command-line arguments for the Hermod pipeline runner.
#[derive(Parser, Debug)]
#[command(name = "hermod")]
#[command(about = "Change-data-capture and event-ingestion pipeline runner")]
struct Args {
    /// Path to the pipeline YAML deployment spec.
    #[arg(short, long)]
    pipeline: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let yaml = std::fs::read_to_string(&args.pipeline)
        .with_context(|| format!("reading pipeline spec {}", args.pipeline.display()))?;
    let spec = PipelineSpec::from_yaml(&yaml).context("parsing pipeline spec")?;

    info!(pipeline = %spec.name, sinks = spec.sinks.len(), "starting hermod pipeline");

    let source = hermod_sources::build_source(spec.source)
        .await
        .context("building source")?;

    let mut sinks = Vec::with_capacity(spec.sinks.len());
    for sink_spec in spec.sinks {
        let id = sink_spec.id().to_string();
        let sink = hermod_sinks::build_sink(sink_spec)
            .await
            .with_context(|| format!("building sink {id}"))?;
        sinks.push(sink);
    }

    let engine = Engine::new(source, sinks, spec.engine);
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();

    let handle = tokio::spawn(engine.run(run_cancel));
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
        }
        cancel.cancel();
    });

    handle
        .await
        .context("engine task panicked")?
        .context("engine exited with a fatal error")?;

    Ok(())
}
