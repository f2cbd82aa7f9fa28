//! Command-line argument definitions

use std::path::PathBuf;

use clap::Args;

use crate::domain::errors::DomainError;
use crate::domain::model::*;
use crate::domain::presets::find_preset;
use crate::domain::rules::ContainerRules;

fn quantizer_in_range(s: &str) -> Result<u8, String> {
    clap_num::number_range(s, 0, 63)
}

fn positive_fps(s: &str) -> Result<f64, String> {
    let fps: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if fps.is_finite() && fps > 0.0 {
        Ok(fps)
    } else {
        Err(format!("{} is not a positive frame rate", s))
    }
}

fn size_in_range(s: &str) -> Result<u32, String> {
    clap_num::number_range(s, 2, 16_384)
}

/// Output settings shared by every command that derives a job
#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Start from a built-in preset (see `presets`)
    #[arg(long)]
    pub preset: Option<String>,

    /// Output width; the height follows the aspect ratio when omitted
    #[arg(long, value_parser = size_in_range)]
    pub target_width: Option<u32>,

    /// Output height; the width follows the aspect ratio when omitted
    #[arg(long, value_parser = size_in_range)]
    pub target_height: Option<u32>,

    /// Encode at a fixed frame rate instead of the source rate
    #[arg(long, value_parser = positive_fps)]
    pub target_fps: Option<f64>,

    /// Video codec string, e.g. avc1.640028 or vp09.00.31.08
    #[arg(long)]
    pub codec: Option<String>,

    /// Variable video bitrate in bits per second
    #[arg(long, conflicts_with_all = ["quantizer", "target_size"])]
    pub bitrate: Option<u64>,

    /// Use constant instead of variable bitrate
    #[arg(long, requires = "bitrate")]
    pub cbr: bool,

    /// Constant quantizer (0-63)
    #[arg(long, value_parser = quantizer_in_range, conflicts_with = "target_size")]
    pub quantizer: Option<u8>,

    /// Aim for an output of about this many megabytes
    #[arg(long)]
    pub target_size: Option<f64>,

    /// Audio codec string, e.g. mp4a.40.2 or opus
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Audio bitrate in bits per second
    #[arg(long)]
    pub audio_bitrate: Option<u64>,

    /// Drop the audio track
    #[arg(long, conflicts_with_all = ["audio_codec", "audio_bitrate"])]
    pub no_audio: bool,

    /// Output container (mp4 or webm); inferred from the codec by default
    #[arg(long)]
    pub container: Option<String>,
}

impl OutputArgs {
    /// Layer preset and flags over `base`.
    ///
    /// `duration_seconds` is needed to turn `--target-size` into a bitrate.
    pub fn apply(&self, base: OutputSpec, duration_seconds: Option<f64>) -> Result<OutputSpec, DomainError> {
        let mut spec = match &self.preset {
            Some(name) => find_preset(name)?.to_output_spec(),
            None => base,
        };

        if self.target_width.is_some() || self.target_height.is_some() {
            spec.width = self.target_width;
            spec.height = self.target_height;
        }
        if let Some(fps) = self.target_fps {
            spec.framerate_mode = FramerateMode::Fixed;
            spec.framerate = fps;
        }
        if let Some(codec) = &self.codec {
            spec.video_codec = codec.clone();
        }
        if let Some(codec) = &self.audio_codec {
            spec.audio_codec = Some(codec.clone());
        }
        if let Some(bitrate) = self.audio_bitrate {
            spec.audio_bitrate = Some(bitrate);
        }
        if self.no_audio {
            spec.audio_codec = None;
        }
        if let Some(container) = &self.container {
            spec.container = Some(Container::parse(container)?);
        }

        if let Some(bitrate) = self.bitrate {
            spec.rate_control = if self.cbr {
                RateControl::Constant(bitrate)
            } else {
                RateControl::Variable(bitrate)
            };
        } else if let Some(q) = self.quantizer {
            spec.rate_control = RateControl::Quantizer(q);
        } else if let Some(megabytes) = self.target_size {
            let duration = duration_seconds.ok_or_else(|| {
                DomainError::BadArgs("--target-size needs a known source duration".to_string())
            })?;
            if !(megabytes > 0.0) {
                return Err(DomainError::BadArgs("--target-size must be positive".to_string()));
            }
            let audio = spec.audio_codec.as_ref().map(|_| spec.audio_bitrate.unwrap_or(128_000));
            let bytes = (megabytes * 1_000_000.0) as u64;
            let video = ContainerRules::target_video_bitrate(bytes, duration, audio)?;
            spec.rate_control = RateControl::Variable(video);
        }

        spec.validate()?;
        Ok(spec)
    }
}

/// Arguments for the plan command
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Source width
    #[arg(long, value_parser = size_in_range)]
    pub width: u32,

    /// Source height
    #[arg(long, value_parser = size_in_range)]
    pub height: u32,

    /// Source frame rate
    #[arg(long, value_parser = positive_fps)]
    pub fps: Option<f64>,

    /// Source duration in seconds, for --target-size
    #[arg(long)]
    pub duration: Option<f64>,

    /// Source audio sample rate
    #[arg(long, default_value = "48000")]
    pub sample_rate: u32,

    /// Source audio channel count
    #[arg(long, default_value = "2")]
    pub channels: u32,

    /// The source has no audio track
    #[arg(long)]
    pub silent: bool,

    /// Input file name, used to suggest an output name
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Arguments for the presets command
#[derive(Args, Debug)]
pub struct PresetsArgs {
    /// Print the presets as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the simulate command
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of video frames in the synthetic source
    #[arg(long, default_value = "300")]
    pub frames: u64,

    /// Source frame rate
    #[arg(long, default_value = "30", value_parser = positive_fps)]
    pub fps: f64,

    /// Source width
    #[arg(long, default_value = "1280", value_parser = size_in_range)]
    pub width: u32,

    /// Source height
    #[arg(long, default_value = "720", value_parser = size_in_range)]
    pub height: u32,

    /// Give the source an AAC audio track
    #[arg(long)]
    pub audio: bool,

    /// Output latency of every simulated codec, in milliseconds
    #[arg(long, default_value = "0")]
    pub latency_ms: u64,

    /// Timestamp of the first source sample, in milliseconds
    #[arg(long, default_value = "0")]
    pub start_offset_ms: i64,

    /// Make the video encoder stop after this many chunks
    #[arg(long)]
    pub video_emit_limit: Option<u64>,

    /// Write the simulated container stream to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Replace an existing output file
    #[arg(long)]
    pub overwrite: bool,

    /// Print the job report as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub settings: OutputArgs,
}

/// Arguments for the transcode command
#[cfg(feature = "ffmpeg")]
#[derive(Args, Debug)]
pub struct TranscodeArgs {
    /// Input media file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output file (default: derived from the input name and bitrate)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Replace an existing output file
    #[arg(long)]
    pub overwrite: bool,

    /// Print the job report as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub settings: OutputArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_preset() {
        let args = OutputArgs {
            preset: Some("vbr-1080p30".to_string()),
            bitrate: Some(2_000_000),
            cbr: true,
            no_audio: true,
            ..OutputArgs::default()
        };
        let spec = args.apply(OutputSpec::default(), None).unwrap();
        assert_eq!(spec.rate_control, RateControl::Constant(2_000_000));
        assert_eq!(spec.audio_codec, None);
        assert_eq!(spec.height, Some(1080));
    }

    #[test]
    fn test_target_size_needs_duration() {
        let args = OutputArgs {
            target_size: Some(10.0),
            ..OutputArgs::default()
        };
        assert!(args.apply(OutputSpec::default(), None).is_err());
        let spec = args.apply(OutputSpec::default(), Some(60.0)).unwrap();
        assert_eq!(spec.rate_control, RateControl::Variable(1_178_666));
    }

    #[test]
    fn test_fixed_framerate_and_container() {
        let args = OutputArgs {
            target_fps: Some(24.0),
            container: Some("webm".to_string()),
            codec: Some("vp09.00.31.08".to_string()),
            audio_codec: Some("opus".to_string()),
            ..OutputArgs::default()
        };
        let spec = args.apply(OutputSpec::default(), None).unwrap();
        assert_eq!(spec.framerate_mode, FramerateMode::Fixed);
        assert_eq!(spec.framerate, 24.0);
        assert_eq!(spec.container, Some(Container::Webm));
    }

    #[test]
    fn test_quantizer_range() {
        assert_eq!(quantizer_in_range("28"), Ok(28));
        assert!(quantizer_in_range("64").is_err());
        assert!(positive_fps("0").is_err());
    }
}
