//! CLI module for TranscodeX
//!
//! This module handles command-line argument parsing and command execution.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod args;
pub mod commands;

/// TranscodeX media transcoder
///
/// Re-encodes media through a demux, decode, encode and mux pipeline with
/// derived output geometry, codec levels and bitrates.
#[derive(Parser, Debug)]
#[command(name = "transcoder")]
#[command(about = "TranscodeX - Media transcoding pipeline")]
#[command(version)]
#[command(long_about = None)]
pub struct Cli {
    /// Configuration file (default: transcodex.toml when present)
    #[arg(long, global = true, env = "TRANSCODEX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging filter, e.g. info or transcodex_cli=debug
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format (text or json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Emit progress as JSON lines on stdout
    #[arg(long, global = true)]
    pub json_progress: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the output parameters derived for a source
    Plan(args::PlanArgs),
    /// List built-in presets
    Presets(args::PresetsArgs),
    /// Run the pipeline over a synthetic source
    Simulate(args::SimulateArgs),
    /// Transcode a media file
    #[cfg(feature = "ffmpeg")]
    Transcode(args::TranscodeArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::try_parse_from([
            "transcoder", "plan", "--width", "1920", "--height", "1080", "--target-height", "720",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan(args) => {
                assert_eq!(args.width, 1920);
                assert_eq!(args.output.target_height, Some(720));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_rate_controls() {
        let result = Cli::try_parse_from([
            "transcoder", "simulate", "--bitrate", "1000000", "--quantizer", "20",
        ]);
        assert!(result.is_err());
    }
}
