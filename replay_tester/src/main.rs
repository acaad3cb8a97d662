use anyhow::{Context, Result, bail};
use clap::Parser;
use guidewire_vision::config::TrackingConfig;
use guidewire_vision::core_modules::frame::{Frame, FrameMetadata, SlicePosition};
use guidewire_vision::core_modules::scan_plane::{ScanPlaneController, SimulatedScanPlane, wants_move};
use guidewire_vision::pipeline::{Motion, Report, TrackingPipeline};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(about = "Replays a directory of segmentation masks through the guidewire tracker")]
pub struct Args {
    /// Directory of 8-bit segmentation masks (PNG), replayed in file-name order.
    pub input_folder: PathBuf,
    /// Where overlay PNGs are written.
    pub output_folder: PathBuf,
    /// JSON tracking configuration. Command-line options are ignored when given.
    #[arg(long)]
    pub config_file: Option<PathBuf>,
    #[arg(long, default_value_t = 1.0)]
    pub mm_per_px: f64,
    /// Simulated scanner that settles after this many polls. Moves only happen
    /// with `--follow-guidewire`.
    #[arg(long)]
    pub simulate_scanner: Option<u32>,
    /// One line per frame: id, latency, centroids.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    #[arg(long, default_value_t = LevelFilter::INFO)]
    pub log_level: LevelFilter,
    #[command(flatten)]
    pub config: TrackingConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Argument Parsing & Setup ---
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = match &args.config_file {
        Some(path) => TrackingConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            args.config.validate().context("invalid tracking options")?;
            args.config.clone()
        }
    };
    if !(args.mm_per_px.is_finite() && args.mm_per_px > 0.0) {
        bail!("--mm-per-px must be a positive number, got {}", args.mm_per_px);
    }

    let inputs = mask_paths(&args.input_folder)?;
    if inputs.is_empty() {
        bail!("no PNG masks found in {}", args.input_folder.display());
    }
    std::fs::create_dir_all(&args.output_folder)
        .with_context(|| format!("creating {}", args.output_folder.display()))?;
    let mut frame_log = match &args.log_file {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    // --- 2. Pipeline & Scanner Initialization ---
    let mut pipeline = TrackingPipeline::new(config.clone())?;
    let scanner = args
        .simulate_scanner
        .map(|polls| Arc::new(SimulatedScanPlane::new(SlicePosition::default()).with_settle_polls(polls)));
    let mut controller = scanner
        .clone()
        .map(|scanner| ScanPlaneController::new(scanner, &config));
    let (_cancel_tx, mut cancel) = watch::channel(false);

    // --- 3. Main Processing Loop ---
    let mut moves = 0u32;
    for (frame_id, path) in inputs.iter().enumerate() {
        let image = image::open(path)
            .with_context(|| format!("reading {}", path.display()))?
            .into_luma8();
        let mut metadata = FrameMetadata::new(frame_id as u64, args.mm_per_px);
        if let Some(scanner) = &scanner {
            metadata = metadata.with_slice_position(scanner.position());
        }
        let frame = Frame::new(image, metadata);

        let report = pipeline.process(&frame);
        println!("{}", report.status_line());

        let Some(analysis) = report.analysis() else {
            continue;
        };

        // --- 4. Diagnostics ---
        let overlay_path = args.output_folder.join(format!("overlay_{frame_id:05}.png"));
        analysis
            .overlay
            .save(&overlay_path)
            .with_context(|| format!("writing {}", overlay_path.display()))?;
        println!("{}", analysis.artifacts.to_json()?);
        if let Some(log) = frame_log.as_mut() {
            writeln!(
                log,
                "{} {:.3} {:?}",
                frame_id,
                frame.metadata.latency().as_secs_f64() * 1000.0,
                analysis.centroids.iter().map(|c| (c.x, c.y)).collect::<Vec<_>>()
            )?;
        }

        // --- 5. Scan-Plane Following ---
        let Some(motion) = motion_to_follow(&config, &report) else {
            continue;
        };
        let Some(controller) = controller.as_mut() else {
            continue;
        };
        match controller
            .request_move(motion, args.mm_per_px, pipeline.registry_mut(), &mut cancel)
            .await
        {
            Ok(outcome) => {
                moves += 1;
                println!("{}", outcome.status_line());
            }
            Err(err) if err.is_scan_plane_failure() => warn!(%err, "scan plane move failed"),
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(mut log) = frame_log {
        log.flush()?;
    }
    info!(
        frames = pipeline.frames_processed(),
        moves,
        output = %args.output_folder.display(),
        "replay complete"
    );
    Ok(())
}

/// The motion the scan plane should follow for this report, if any.
fn motion_to_follow(config: &TrackingConfig, report: &Report) -> Option<Motion> {
    if !config.follow_guidewire {
        return None;
    }
    match report {
        Report::Movement(analysis) => analysis
            .motion
            .as_ref()
            .map(|m| m.vector_px)
            .filter(|m| wants_move(m, config.movement_threshold)),
        _ => None,
    }
}

/// PNG files directly inside `folder`, sorted by name.
fn mask_paths(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(folder).with_context(|| format!("listing {}", folder.display()))? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
        if path.is_file() && is_png {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
