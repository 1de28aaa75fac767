// SPDX-License-Identifier: GPL-3.0-only

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use stillcam::backends::camera::{CameraBackendType, Size, StreamRole};
use stillcam::config::PhotoOutputFormat;
use stillcam::constants::DEFAULT_LOG_FILTER;
use stillcam::{QualityPreset, logging};
use tracing::error;

mod cli;

#[derive(Parser)]
#[command(name = "stillcam")]
#[command(about = "Single-shot still capture for libcamera devices")]
#[command(version = env!("GIT_VERSION"))]
#[command(subcommand_required = false)]
struct Cli {
    /// Configuration file (default: ~/.config/stillcam/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON-lines system log (default from configuration: logs/system.log)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    List {
        /// Camera backend to query
        #[arg(short, long)]
        backend: Option<CameraBackendType>,
    },

    /// Take photos through the request pipeline (default command)
    Photo(PhotoArgs),

    /// Grab one frame from a V4L2 node and write it as PPM
    Simple {
        /// V4L2 device index (/dev/videoN)
        #[arg(short, long)]
        device: Option<usize>,

        /// Output file (default: image.ppm)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Options of the `photo` command; each overrides the configuration file
#[derive(Args, Default)]
struct PhotoArgs {
    /// Camera backend (libcamera or virtual)
    #[arg(short, long)]
    backend: Option<CameraBackendType>,

    /// Camera index (from 'stillcam list') or camera id
    #[arg(short, long)]
    camera: Option<String>,

    /// Output file; every frame overwrites it
    #[arg(short, long, conflicts_with = "dir")]
    output: Option<PathBuf>,

    /// Output directory for timestamped names (default: ~/Pictures/stillcam)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Image format (jpeg or png)
    #[arg(short, long)]
    format: Option<PhotoOutputFormat>,

    /// JPEG quality (low, medium, high, maximum)
    #[arg(short, long)]
    quality: Option<QualityPreset>,

    /// Stream role the configuration is generated for
    #[arg(long)]
    role: Option<StreamRole>,

    /// Requested resolution, e.g. 2304x1296
    #[arg(short, long)]
    resolution: Option<Size>,

    /// Images saved per capture
    #[arg(short = 'n', long)]
    frames: Option<u32>,

    /// Capture timeout in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Number of captures in one session
    #[arg(long, default_value = "1")]
    repeat: u32,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::from(err.exit_code());
        }
    };

    // Set RUST_LOG to control console output, e.g. RUST_LOG=stillcam=debug
    let log_file = cli.log_file.clone().unwrap_or_else(|| config.log_file.clone());
    let log_level = config.log_level.parse().unwrap_or(tracing::Level::INFO);
    if let Err(err) = logging::init(DEFAULT_LOG_FILTER, &log_file, log_level) {
        eprintln!("Warning: {}", err);
    }

    let result = match cli.command {
        Some(Commands::List { backend }) => cli::list_cameras(&config, backend),
        Some(Commands::Photo(args)) => cli::take_photo(config, &args),
        Some(Commands::Simple { device, output }) => cli::simple_photo(&config, device, output),
        Some(Commands::Config { init }) => cli::show_config(&config, cli.config.as_deref(), init),
        None => cli::take_photo(config, &PhotoArgs::default_invocation()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Command failed");
            eprintln!("Error: {}", err);
            ExitCode::from(err.exit_code())
        }
    }
}

impl PhotoArgs {
    /// `stillcam` without a subcommand behaves like `stillcam photo`
    fn default_invocation() -> Self {
        Self {
            repeat: 1,
            ..Self::default()
        }
    }
}
