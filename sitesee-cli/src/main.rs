// Sitesee Command Line Interface
// Convert, synthesize and replay raw NV12 camera frames through the detection pipeline

mod replay;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sitesee_eye::convert::{convert, Roi};
use sitesee_eye::frame::PlanarYuvBuffer;
use sitesee_eye::PipelineConfig;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sitesee")]
#[command(about = "Sitesee frame pipeline tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one raw NV12 frame into a PNG
    Convert {
        /// Raw NV12 frame file
        #[arg(long, short)]
        input: PathBuf,

        /// Output PNG path
        #[arg(long, short)]
        output: PathBuf,

        /// Luma plane width
        #[arg(long, default_value = "1280")]
        width: u32,

        /// Luma plane height
        #[arg(long, default_value = "720")]
        height: u32,

        /// First converted row
        #[arg(long, default_value = "0")]
        top: u32,

        /// First converted column
        #[arg(long, default_value = "0")]
        left: u32,

        /// Number of converted rows
        #[arg(long, default_value = "360")]
        rows: u32,

        /// Number of converted columns
        #[arg(long, default_value = "640")]
        cols: u32,

        /// Side of the square output raster
        #[arg(long, default_value = "640")]
        target: u32,
    },

    /// Write a synthetic NV12 frame
    Generate {
        /// Output frame file
        #[arg(long, short)]
        output: PathBuf,

        #[arg(long, default_value = "1280")]
        width: u32,

        #[arg(long, default_value = "720")]
        height: u32,

        /// Frame content
        #[arg(long, value_enum, default_value = "flat")]
        pattern: Pattern,

        /// Luma value (flat pattern, or the box for the box pattern)
        #[arg(long, default_value = "128")]
        y: u8,

        /// U value
        #[arg(long, default_value = "128")]
        u: u8,

        /// V value
        #[arg(long, default_value = "128")]
        v: u8,
    },

    /// Feed a frame file through the pipeline at a fixed delivery rate
    Replay {
        /// Raw NV12 frame file
        #[arg(long, short)]
        input: PathBuf,

        /// Pipeline configuration (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Number of deliveries
        #[arg(long, default_value = "30")]
        frames: u32,

        /// Delay between deliveries in milliseconds
        #[arg(long, default_value = "33")]
        interval_ms: u64,

        /// Luma threshold for the reference detector
        #[arg(long, default_value = "200")]
        threshold: u8,

        /// Dump every converted raster as PNG
        #[arg(long)]
        dump: bool,

        /// Dump directory (defaults to ~/.sitesee/frames)
        #[arg(long)]
        dump_dir: Option<PathBuf>,

        /// Deliver frames without a metadata blob
        #[arg(long)]
        no_metadata: bool,
    },

    /// Print the effective configuration as JSON
    ShowConfig {
        /// Pipeline configuration (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Pattern {
    /// Constant Y, U and V
    Flat,
    /// Bright box on a dark background
    Box,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Convert { input, output, width, height, top, left, rows, cols, target } => {
            convert_frame(&input, &output, width, height, Roi::new(top, left, rows, cols), target)?;
        }
        Commands::Generate { output, width, height, pattern, y, u, v } => {
            generate_frame(&output, width, height, pattern, y, u, v)?;
        }
        Commands::Replay { input, config, frames, interval_ms, threshold, dump, dump_dir, no_metadata } => {
            let mut config = load_config(config.as_deref())?;
            if dump || dump_dir.is_some() {
                config.debug_dump_dir = Some(dump_dir.unwrap_or_else(PipelineConfig::default_dump_dir));
            }
            let options = replay::ReplayOptions {
                frames,
                interval_ms,
                threshold,
                with_metadata: !no_metadata,
            };
            replay::run(&input, config, options).await?;
        }
        Commands::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path)),
        None => Ok(PipelineConfig::default()),
    }
}

fn convert_frame(
    input: &Path,
    output: &Path,
    width: u32,
    height: u32,
    roi: Roi,
    target: u32,
) -> anyhow::Result<()> {
    let data = std::fs::read(input).with_context(|| format!("Failed to read {:?}", input))?;
    let buffer = PlanarYuvBuffer::new(&data, width, height)?;

    let started = std::time::Instant::now();
    let raster = convert(&buffer, roi, target)?;
    let elapsed = started.elapsed();

    raster
        .save_png(output)
        .with_context(|| format!("Failed to write {:?}", output))?;

    info!("Converted {:?} in {:.2} ms", input, elapsed.as_secs_f64() * 1000.0);
    println!("Wrote {}x{} raster to {}", target, target, output.display());
    Ok(())
}

fn generate_frame(
    output: &Path,
    width: u32,
    height: u32,
    pattern: Pattern,
    y: u8,
    u: u8,
    v: u8,
) -> anyhow::Result<()> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        anyhow::bail!("Frame dimensions must be even and non-zero, got {}x{}", width, height);
    }

    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    let mut data = vec![0u8; luma + luma / 2];

    match pattern {
        Pattern::Flat => data[..luma].fill(y),
        Pattern::Box => {
            // Box covers the middle half of the top half of the frame.
            let (x0, x1) = (w / 8, w / 8 * 3);
            let (y0, y1) = (h / 8, h / 8 * 3);
            for row in y0..y1 {
                data[row * w + x0..row * w + x1].fill(y);
            }
        }
    }

    for pair in data[luma..].chunks_exact_mut(2) {
        pair[0] = u;
        pair[1] = v;
    }

    std::fs::write(output, &data).with_context(|| format!("Failed to write {:?}", output))?;
    println!("Wrote {}x{} {:?} frame ({} bytes) to {}", width, height, pattern, data.len(), output.display());
    Ok(())
}
