//! Continuum pipeline command-line driver.
//!
//! Images every target of an exported observation and publishes the results.
//!
//! # Usage
//!
//! ```bash
//! contim-pipeline /data/1551234567 \
//!     --config contim.toml \
//!     --scans 1-20 --targets PKS1934-63 \
//!     --uvblavg "maxInt=1.0" --mfimage "Niter=20000" \
//!     --store file --store-path /var/lib/contim/state.json \
//!     --export-dir /data/products --report run.json
//! ```
//!
//! `--export-only` stops after the per-target merge and leaves the merged
//! UV files on the work disk.
//!
//! # Environment Variables
//!
//! - `OBIT_EXEC_DIR`: directory holding the Obit task executables
//! - `STATE_STORE_TYPE`, `STATE_STORE_PATH`: state store selection
//! - `RUST_LOG`: Log level (default: info)
//!
//! # Exit status
//!
//! 0 when every target was published, 1 when any target failed, 2 when the
//! run itself failed or was cancelled.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use contim::config::{PipelineConfig, RunMode};
use contim::pipeline::{parse_scan_list, ContinuumPipeline, ScanSelection};
use contim::source::{ManifestSource, ObservationSource};
use contim::store::StoreFactory;
use obit_task::ProcessTaskRunner;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "contim-pipeline", version, about = "Continuum imaging pipeline")]
struct Cli {
    /// Exported observation directory (holding observation.json)
    observation: PathBuf,

    /// Configuration file; defaults to contim.toml in the usual places
    #[arg(long)]
    config: Option<PathBuf>,

    /// Staging disk root
    #[arg(long)]
    staging_disk: Option<PathBuf>,

    /// Work disk root for merged targets and images
    #[arg(long)]
    work_disk: Option<PathBuf>,

    /// Capture block id used in state-store keys; defaults to the observation id
    #[arg(long)]
    capture_block_id: Option<String>,

    /// Output label appended to the capture block id
    #[arg(long)]
    output_id: Option<String>,

    /// Scans to process, e.g. `1,3,5-8`
    #[arg(long)]
    scans: Option<String>,

    /// Comma-separated target names to process
    #[arg(long, value_delimiter = ',')]
    targets: Vec<String>,

    /// Extra UVBlAvg parameters, `key=value; key=value`
    #[arg(long)]
    uvblavg: Option<String>,

    /// Extra MFImage parameters, `key=value; key=value`
    #[arg(long)]
    mfimage: Option<String>,

    /// State store type (`local` or `file`)
    #[arg(long)]
    store: Option<String>,

    /// State store document path for the file store
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Directory for FITS images, metadata.json and qa_report.json
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Merge targets without imaging them
    #[arg(long)]
    export_only: bool,

    /// Write the run report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

fn append_overrides(existing: &mut String, extra: Option<String>) {
    if let Some(extra) = extra {
        if existing.trim().is_empty() {
            *existing = extra;
        } else {
            *existing = format!("{}; {}", existing, extra);
        }
    }
}

fn load_config(cli: &mut Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::from_default_location().unwrap_or_else(|e| {
            info!("{}; using built-in defaults", e);
            PipelineConfig::default()
        }),
    };
    config.apply_env();

    if let Some(dir) = cli.staging_disk.take() {
        config.disks.staging = dir;
    }
    if let Some(dir) = cli.work_disk.take() {
        config.disks.work = dir;
    }
    if let Some(id) = cli.output_id.take() {
        config.output.output_id = id;
    }
    if let Some(store) = cli.store.take() {
        config.store.store_type = store;
    }
    if let Some(path) = cli.store_path.take() {
        config.store.path = Some(path);
    }
    if let Some(dir) = cli.export_dir.take() {
        config.output.export_dir = Some(dir);
    }
    if cli.export_only {
        config.output.mode = RunMode::ExportOnly;
    }
    append_overrides(&mut config.averaging.overrides, cli.uvblavg.take());
    append_overrides(&mut config.imaging.overrides, cli.mfimage.take());
    config.validate()?;
    Ok(config)
}

async fn run(mut cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&mut cli)?;
    let source = ManifestSource::open(&cli.observation)
        .with_context(|| format!("opening {}", cli.observation.display()))?;
    info!(
        "Observation {}: {} targets, {} scans",
        source.metadata().id,
        source.metadata().targets.len(),
        source.scans().len()
    );

    let store = StoreFactory::from_settings(&config.store).await?;
    let runner = Arc::new(ProcessTaskRunner::new(
        config.obit.exec_dir.clone(),
        config.disks.work.clone(),
    ));
    let selection = ScanSelection {
        scans: cli
            .scans
            .as_deref()
            .map(parse_scan_list)
            .transpose()?
            .unwrap_or_default(),
        targets: cli.targets.clone(),
    };

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight work");
            signal.cancel();
        }
    });

    let mut pipeline = ContinuumPipeline::new(config, Arc::new(source), runner, store, cancel)?
        .with_selection(selection);
    if let Some(id) = cli.capture_block_id.take() {
        pipeline = pipeline.with_capture_block_id(id);
    }

    let report = pipeline.execute().await;
    let json = serde_json::to_string_pretty(&report)?;
    match &cli.report {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("writing report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    info!(
        "Run {} finished {:?}: {} targets, {} dropped scans",
        report.run_id,
        report.status,
        report.targets.len(),
        report.dropped_scans()
    );
    Ok(report.exit_code())
}

#[tokio::main]
async fn main() {
    FmtSubscriber::builder()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Level::INFO),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            2
        }
    };
    std::process::exit(code);
}
