use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chromacc_core::decoders;
use chromacc_core::models::ImageRecord;
use chromacc_core::pipeline::StageFlags;
use chromacc_engine::workers::io_workers_for_host;
use chromacc_engine::{
    BatchOrchestrator, BatchRequest, EngineConfig, SessionRegistry, ShutdownCoordinator,
};

mod reference;

use reference::ChannelGainFactory;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff"];
const POLL_INTERVAL_MS: u64 = 250;

#[derive(Parser)]
#[command(name = "chromacc")]
#[command(version, about = "Batch color correction engine", long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Correct every image in a directory as one batch
    Run {
        /// Input directory
        #[arg(value_name = "DIR")]
        input: PathBuf,

        /// Output directory (default: <input>/corrected)
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// White reference image for flat-field correction
        #[arg(short, long, value_name = "FILE")]
        white: Option<PathBuf>,

        /// Stages to run, comma-separated (ffc,gc,wb,cc)
        #[arg(long, value_name = "LIST", default_value = "gc,wb,cc")]
        stages: String,

        /// Correction method (pls, nn, linear, svm, conventional)
        #[arg(short, long, value_name = "METHOD", default_value = "pls")]
        method: String,

        /// Number of parallel workers
        #[arg(short = 'j', long, value_name = "N")]
        workers: Option<usize>,

        /// Per-stage settings override as stage=JSON (repeatable)
        #[arg(long, value_name = "STAGE=JSON")]
        set: Vec<String>,
    },

    /// Run the pipeline on a single image with full diagnostics
    Single {
        /// Input file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output file for the final corrected image
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,

        /// White reference image for flat-field correction
        #[arg(short, long, value_name = "FILE")]
        white: Option<PathBuf>,

        /// Stages to run, comma-separated (ffc,gc,wb,cc)
        #[arg(long, value_name = "LIST", default_value = "gc,wb,cc")]
        stages: String,

        /// Correction method (pls, nn, linear, svm, conventional)
        #[arg(short, long, value_name = "METHOD", default_value = "pls")]
        method: String,
    },
}

fn parse_stages(list: &str) -> Result<StageFlags, String> {
    let mut flags = StageFlags::default();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name {
            "ffc" => flags.ffc = true,
            "gc" => flags.gc = true,
            "wb" => flags.wb = true,
            "cc" => flags.cc = true,
            other => return Err(format!("Unknown stage '{other}' (expected ffc, gc, wb, cc)")),
        }
    }
    if !flags.any() {
        return Err("No stages selected".to_string());
    }
    Ok(flags)
}

fn collect_images(dir: &Path) -> Result<Vec<ImageRecord>, String> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| format!("Failed to read directory {}: {e}", dir.display()))?;

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| format!("Failed to read directory entry: {e}"))?;
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        records.push(ImageRecord::new(filename, path));
    }
    records.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(records)
}

/// Apply `stage={...}` overrides from the command line to the registry.
fn apply_overrides(registry: &SessionRegistry, overrides: &[String]) -> Result<(), String> {
    for raw in overrides {
        let (stage, json) = raw
            .split_once('=')
            .ok_or_else(|| format!("Bad settings override '{raw}' (expected stage=JSON)"))?;
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| format!("Bad JSON in settings override '{raw}': {e}"))?;
        registry
            .update_settings_json(stage.trim(), value)
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn cmd_run(
    input: PathBuf,
    out: Option<PathBuf>,
    white: Option<PathBuf>,
    stages: String,
    method: String,
    workers: Option<usize>,
    set: Vec<String>,
) -> Result<(), String> {
    let stages = parse_stages(&stages)?;
    let out_dir = out.unwrap_or_else(|| input.join("corrected"));

    let registry = Arc::new(SessionRegistry::new());
    let records = collect_images(&input)?;
    if records.is_empty() {
        return Err(format!("No images found in {}", input.display()));
    }
    info!(count = records.len(), dir = %input.display(), "Registered images");
    registry.add_images(records);

    if let Some(white_path) = white {
        let filename = white_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        registry.set_white_image(ImageRecord::new(filename, white_path));
    }
    apply_overrides(&registry, &set)?;

    let config = EngineConfig::from_env();
    let orchestrator = BatchOrchestrator::new(
        Arc::clone(&registry),
        Arc::new(ChannelGainFactory),
        config.clone(),
    );
    let state = orchestrator.state();

    let coordinator = Arc::new(ShutdownCoordinator::new(orchestrator.state(), config));
    coordinator.on_release(|| info!("Session resources released"));
    {
        let coordinator = Arc::clone(&coordinator);
        ctrlc::set_handler(move || {
            if coordinator.request_shutdown() {
                std::process::exit(130);
            }
        })
        .map_err(|e| format!("Failed to install signal handler: {e}"))?;
    }

    let ticket = orchestrator
        .submit(BatchRequest {
            indices: None,
            stages,
            method,
            workers,
        })
        .map_err(|e| e.to_string())?;
    println!(
        "Batch {} started: {} images on {} workers",
        ticket.batch_id, ticket.total, ticket.workers
    );

    loop {
        let snap = state.snapshot();
        println!(
            "  {}/{} done ({} failed)",
            snap.completed + snap.failed,
            snap.total,
            snap.failed
        );
        if snap.is_terminal() || !snap.active {
            break;
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }
    ticket.wait();

    let snap = state.snapshot();
    for item in snap.progress.iter().filter(|p| p.error.is_some()) {
        warn!(
            filename = %item.filename,
            error = item.error.as_deref().unwrap_or(""),
            "Item failed"
        );
    }

    let results = state.take_results();
    if !results.is_empty() {
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| format!("Failed to create {}: {e}", out_dir.display()))?;
        save_results(&results, &out_dir)?;
    }

    println!(
        "Batch {} finished: {} corrected, {} failed",
        snap.batch_id, snap.completed, snap.failed
    );
    Ok(())
}

/// Persist final corrected images on an I/O-sized pool.
fn save_results(
    results: &[chromacc_engine::ItemResult],
    out_dir: &Path,
) -> Result<(), String> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(io_workers_for_host(results.len()))
        .thread_name(|i| format!("chromacc-io-{i}"))
        .build()
        .map_err(|e| format!("Failed to build save pool: {e}"))?;

    pool.install(|| {
        results.par_iter().try_for_each(|result| {
            let Some(stage) = result.final_stage else {
                return Ok(());
            };
            let Some(image) = result.images.get(&stage) else {
                return Ok(());
            };
            let target = out_dir.join(&result.filename);
            decoders::save_image(image, &target)
        })
    })?;

    info!(count = results.len(), dir = %out_dir.display(), "Saved corrected images");
    Ok(())
}

fn cmd_single(
    input: PathBuf,
    out: Option<PathBuf>,
    white: Option<PathBuf>,
    stages: String,
    method: String,
) -> Result<(), String> {
    let stages = parse_stages(&stages)?;

    let registry = Arc::new(SessionRegistry::new());
    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    registry.add_images(vec![ImageRecord::new(filename, input.clone())]);
    if let Some(white_path) = white {
        let name = white_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        registry.set_white_image(ImageRecord::new(name, white_path));
    }

    let orchestrator = BatchOrchestrator::new(
        registry,
        Arc::new(ChannelGainFactory),
        EngineConfig::from_env(),
    );
    let summary = orchestrator
        .run_single(0, stages, &method)
        .map_err(|e| e.to_string())?;

    println!("{}", summary.filename);
    for (stage, metrics) in &summary.metrics {
        let rendered = serde_json::to_string(metrics)
            .map_err(|e| format!("Failed to render metrics: {e}"))?;
        println!("  {stage}: {rendered}");
    }

    if let Some(target) = out {
        let Some(stage) = summary.final_stage else {
            return Err("Pipeline produced no corrected output".to_string());
        };
        let image = &summary.images[&stage];
        decoders::save_image(image, &target)?;
        println!("  saved {} output to {}", stage, target.display());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let filter = cli
        .log
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Run {
            input,
            out,
            white,
            stages,
            method,
            workers,
            set,
        } => cmd_run(input, out, white, stages, method, workers, set),
        Commands::Single {
            input,
            out,
            white,
            stages,
            method,
        } => cmd_single(input, out, white, stages, method),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
