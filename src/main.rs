//! TranscodeX CLI
//!
//! Command-line front end for the transcoding pipeline.
//!
//! # Usage
//!
//! ```bash
//! transcoder plan --width 1920 --height 1080 --target-height 720
//! transcoder presets
//! transcoder simulate --frames 300 --audio --latency-ms 2
//! transcoder transcode --input clip.mov --preset vbr-1080p30
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use transcodex_cli::adapters::toml_config::TomlConfigAdapter;
use transcodex_cli::adapters::tracing_log::init_logging;
use transcodex_cli::cli::commands::{self, ProgressMode};
use transcodex_cli::cli::{Cli, Commands};

/// Main entry point for the TranscodeX CLI application
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Defaults < TOML file < environment < command-line flags
    let mut config = TomlConfigAdapter::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config
        .apply_environment()
        .context("Invalid environment override")?;
    if let Some(level) = &cli.log_level {
        config.set("logging.level", level)?;
    }
    if let Some(format) = &cli.log_format {
        config.set("logging.format", format)?;
    }
    let source = config.source().map(|p| p.display().to_string());
    let config = config.into_config();
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging)?;
    info!("Starting TranscodeX");
    if let Some(path) = source {
        debug!("Configuration file: {}", path);
    }

    let progress = ProgressMode::from_flags(cli.json_progress, cli.quiet);
    match cli.command {
        Commands::Plan(args) => commands::plan(args, &config)?,
        Commands::Presets(args) => commands::presets(args)?,
        Commands::Simulate(args) => commands::simulate(args, &config, progress).await?,
        #[cfg(feature = "ffmpeg")]
        Commands::Transcode(args) => commands::transcode(args, &config, progress).await?,
    }

    Ok(())
}
