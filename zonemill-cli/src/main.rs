use std::{
    fmt::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zonemill_core::{
    assign::{PerformanceLedger, PerformanceSnapshot, ProcessingStrategy},
    entities::ZoneType,
    orchestrator::ZoneEventKind,
    EnhancedOrchestrator, PipelineConfig, ReplayTool, ToolRegistry,
};

mod manifest;
mod output;

use manifest::{parse_threshold, Manifest};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Zonemill - zone-level extraction with confidence-driven fallback",
    long_about = "Zonemill routes every detected zone of a document to the extraction tools suited to it, scores what they return, falls back to the next tool until a result is good enough and merges the accepted outputs."
)]
struct Args {
    /// Path to the document manifest (zones, page content and recorded tool outputs)
    manifest: PathBuf,

    /// Pipeline configuration file (TOML)
    ///
    /// Defaults to `<config dir>/zonemill/config.toml` when it exists.
    #[arg(long, short('c'), env = "ZONEMILL_CONFIG")]
    config: Option<PathBuf>,

    /// Tool performance snapshot (JSON) used to rank and prune candidates
    #[arg(long, env = "ZONEMILL_HISTORY")]
    history: Option<PathBuf>,

    /// Write the updated performance snapshot back to --history after the run
    #[arg(long, default_value_t = false, requires = "history")]
    update_history: bool,

    /// Override thresholds for a zone type, e.g. `table=0.4:0.8`. Repeatable.
    #[arg(long = "threshold", short('t'), value_parser = parse_threshold)]
    thresholds: Vec<(ZoneType, f32, f32)>,

    #[arg(long, help = "Candidate strategy: auto, fast, balanced or accurate")]
    strategy: Option<ProcessingStrategy>,

    #[arg(long, help = "Number of zones processed concurrently")]
    max_concurrent_zones: Option<usize>,

    #[arg(long, help = "Number of tool invocations running at once")]
    tool_capacity: Option<usize>,

    #[arg(long, help = "Timeout for a single tool attempt, in milliseconds")]
    attempt_timeout_ms: Option<u64>,

    #[arg(long, help = "Time budget for all attempts of a zone, in milliseconds")]
    zone_timeout_ms: Option<u64>,

    #[arg(long, help = "Time budget for the whole document, in milliseconds")]
    document_timeout_ms: Option<u64>,

    /// Keep trying tools after an accept to gather corroboration
    #[arg(long, default_value_t = false)]
    corroborate: bool,

    /// Specifies the target directory where results will be saved
    ///
    /// If not specified, defaults to the current working directory.
    #[arg(long, env = "ZONEMILL_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("zonemill=info,zonemill_core=info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_line_number(true)
        .with_timer(tracing_subscriber::fmt::time::uptime());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let path = args.config.clone().or_else(|| {
        dirs::config_dir()
            .map(|d| d.join("zonemill").join("config.toml"))
            .filter(|p| p.exists())
    });
    let mut config = match path {
        Some(path) => {
            tracing::info!("Loading config from {}", path.display());
            PipelineConfig::from_path(&path)?
        }
        None => PipelineConfig::default(),
    };

    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(n) = args.max_concurrent_zones {
        config.max_concurrent_zones = n;
    }
    if let Some(n) = args.tool_capacity {
        config.tool_capacity = n;
    }
    if let Some(ms) = args.attempt_timeout_ms {
        config.attempt_timeout = std::time::Duration::from_millis(ms);
    }
    if let Some(ms) = args.zone_timeout_ms {
        config.zone_timeout = std::time::Duration::from_millis(ms);
    }
    if args.document_timeout_ms.is_some() {
        config.document_timeout_ms = args.document_timeout_ms;
    }
    if args.corroborate {
        config.continue_after_accept = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_history(path: Option<&Path>) -> anyhow::Result<PerformanceSnapshot> {
    match path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("can't read history {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("invalid history {}", path.display()))
        }
        _ => Ok(PerformanceSnapshot::default()),
    }
}

fn setup_progress_bar(total_zones: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(total_zones as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("#>-"),
    );
    Ok(pb)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(&args)?;
    let manifest = Manifest::load(&args.manifest)?;
    let history = load_history(args.history.as_deref())?;

    let registry = ReplayTool::from_recordings(manifest.recordings)
        .into_iter()
        .fold(ToolRegistry::new(), |registry, tool| {
            registry.with_tool(Arc::new(tool))
        });
    let ledger = Arc::new(PerformanceLedger::new(history.clone()));
    let orchestrator = EnhancedOrchestrator::new(config, registry, Some(ledger.clone()))?;

    for (zone_type, reject_below, accept_above) in &args.thresholds {
        orchestrator.set_threshold(*zone_type, *reject_below, *accept_above)?;
    }

    let total_zones = manifest.document.zones.len();
    let document_id = orchestrator.register_document(manifest.document)?;

    let pb = setup_progress_bar(total_zones)?;
    let mut run = orchestrator.process_document(document_id, Arc::new(history))?;

    let cancel = run.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after zones in flight");
            cancel.cancel();
        }
    });

    while let Some(event) = run.events.next().await {
        match event.kind {
            ZoneEventKind::Attempted {
                tool,
                confidence,
                decision,
                ..
            } => pb.set_message(format!("{tool} {decision} ({confidence:.2})")),
            ZoneEventKind::Finished { outcome, .. } => {
                pb.set_message(format!("zone {} {outcome:?}", event.zone_id));
                pb.inc(1);
            }
            ZoneEventKind::Skipped => pb.inc(1),
            ZoneEventKind::Started => {}
        }
    }
    let report = run.report.await.context("document run aborted")?;
    pb.finish_with_message(format!(
        "Processed document in {}ms",
        report.metadata.processing_duration.as_millis()
    ));

    output::print_summary(&report);
    output::save_results(&orchestrator, &report, args.output_dir.as_ref())?;

    if args.update_history {
        if let Some(path) = &args.history {
            let snapshot = ledger.snapshot();
            std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)
                .with_context(|| format!("can't write history {}", path.display()))?;
            tracing::info!("Performance history updated in {}", path.display());
        }
    }
    Ok(())
}
