// Command-line runner for the `nuclei_tracker` library.
//
// Reads one segmented frame per image file from a directory (sorted by file
// name), tracks the regions and prints one line per trajectory.

use anyhow::{Context, Result, bail};
use clap::Parser;
use flexi_logger::Logger;
use image::GrayImage;
use log::info;
use nuclei_tracker::core_modules::labeling::label_regions;
use nuclei_tracker::core_modules::mask_shape::MaskShape;
use nuclei_tracker::core_modules::watershed::MarkerWatershed;
use nuclei_tracker::parallel_pipeline::ParallelPipeline;
use nuclei_tracker::pipeline::{TrackingConfig, TrackingOutcome, TrackingPipeline};
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "tif", "tiff", "bmp"];

/// Track segmented nuclei across a time-lapse sequence.
#[derive(Parser, Debug)]
#[command(name = "nuclei_tracker", version, about, long_about = None)]
struct Args {
    /// Directory with one label or binary mask image per frame.
    input: PathBuf,

    /// Directory with one intensity image per frame, used to split merged nuclei.
    #[arg(long)]
    intensity: Option<PathBuf>,

    /// JSON file with a tracking configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `max_distance`.
    #[arg(long)]
    max_distance: Option<f64>,

    /// Overrides `watershed_sigma`.
    #[arg(long)]
    watershed_sigma: Option<f64>,

    /// Disables the distance fallback pass.
    #[arg(long, default_value_t = false)]
    no_distance_fallback: bool,

    /// Stage position inserted into cell names.
    #[arg(long)]
    position: Option<u32>,

    /// Overrides `min_region_area`.
    #[arg(long)]
    min_region_area: Option<usize>,

    /// Build the candidate graph on worker threads.
    #[arg(long, default_value_t = false)]
    parallel: bool,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<TrackingConfig> {
    let mut config: TrackingConfig = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => TrackingConfig::default(),
    };

    if let Some(max_distance) = args.max_distance {
        config.max_distance = max_distance;
    }
    if let Some(sigma) = args.watershed_sigma {
        config.watershed_sigma = sigma;
    }
    if args.no_distance_fallback {
        config.enable_distance_fallback = false;
    }
    if args.position.is_some() {
        config.position = args.position;
    }
    if let Some(min_area) = args.min_region_area {
        config.min_region_area = min_area;
    }
    config.validate()?;
    Ok(config)
}

fn frame_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image {
            paths.push(path);
        }
    }
    paths.sort();
    if paths.is_empty() {
        bail!("no images found in {}", dir.display());
    }
    Ok(paths)
}

fn load_gray(paths: &[PathBuf]) -> Result<Vec<GrayImage>> {
    paths
        .iter()
        .map(|path| {
            image::open(path)
                .map(|img| img.to_luma8())
                .with_context(|| format!("loading {}", path.display()))
        })
        .collect()
}

fn print_trajectories(outcome: &TrackingOutcome<MaskShape>) {
    for trajectory in &outcome.trajectories {
        let mother = trajectory
            .mother
            .and_then(|id| outcome.trajectories.iter().find(|t| t.id == id))
            .map(|t| t.name.as_str())
            .unwrap_or("-");
        println!(
            "{}\tmother={}\tframes={}..{}\tpoints={}",
            trajectory.name,
            mother,
            trajectory.first_frame().unwrap_or(0),
            trajectory.last_frame().unwrap_or(0),
            trajectory.len()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _logger = Logger::try_with_str(&args.log_level)?
        .log_to_stderr()
        .start()
        .context("starting logger")?;

    let config = load_config(&args)?;
    let labels = load_gray(&frame_paths(&args.input)?)?;
    let frames: Vec<Vec<MaskShape>> = labels
        .iter()
        .enumerate()
        .map(|(i, image)| label_regions(image, i + 1, config.min_region_area))
        .collect();
    info!("loaded {} frames from {}", frames.len(), args.input.display());

    let sigma = config.watershed_sigma as f32;
    let splitter = match &args.intensity {
        Some(dir) => {
            let intensity = load_gray(&frame_paths(dir)?)?;
            if intensity.len() != labels.len() {
                bail!("{} intensity frames for {} label frames", intensity.len(), labels.len());
            }
            MarkerWatershed::with_intensity(sigma, intensity)
        }
        None => MarkerWatershed::new(sigma),
    };

    let pipeline = TrackingPipeline::new(config, splitter)?;
    let outcome = if args.parallel {
        ParallelPipeline::new(pipeline).track(frames).await?
    } else {
        let mut pipeline = pipeline;
        pipeline.track(frames)?
    };

    print_trajectories(&outcome);
    info!("{:?}", outcome.report);
    Ok(())
}
