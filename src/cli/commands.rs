//! Command implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::adapters::fs_sink::FileDestination;
use crate::adapters::simulated::{
    CodecBehavior, MemoryDestination, SimulatedAudio, SimulatedCodecs, SimulatedDemux, SimulatedMedia,
    SimulatedMuxFactory,
};
use crate::adapters::toml_config::AppConfig;
use crate::app::{PlanInteractor, TranscodeInteractor};
use crate::cli::args::{PlanArgs, PresetsArgs, SimulateArgs};
use crate::domain::model::*;
use crate::domain::presets::BUILTIN_PRESETS;
use crate::engine::progress::{ConsoleReporter, JsonReporter};
use crate::engine::{PipelineIo, TranscodeReport};
use crate::ports::{DestinationSink, NullReporter, ProgressReporter};

/// How progress is shown while a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Console,
    Json,
    Quiet,
}

impl ProgressMode {
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        match (json, quiet) {
            (true, _) => ProgressMode::Json,
            (false, true) => ProgressMode::Quiet,
            (false, false) => ProgressMode::Console,
        }
    }

    fn reporter(self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Console => Arc::new(ConsoleReporter::new(false)),
            ProgressMode::Json => Arc::new(JsonReporter),
            ProgressMode::Quiet => Arc::new(NullReporter),
        }
    }
}

/// Execute the plan command
pub fn plan(args: PlanArgs, config: &AppConfig) -> Result<()> {
    info!("Planning output for a {}x{} source", args.width, args.height);

    let spec = args
        .output
        .apply(config.output.clone(), args.duration)
        .context("Invalid output settings")?;

    let source = SourceDescriptor {
        video: Some(VideoFormat {
            codec: DEFAULT_VIDEO_CODEC.to_string(),
            width: args.width,
            height: args.height,
            framerate: args.fps,
            bitrate: None,
            description: None,
        }),
        audio: (!args.silent).then(|| AudioFormat {
            codec: DEFAULT_AUDIO_CODEC.to_string(),
            sample_rate: args.sample_rate,
            channels: args.channels,
            bitrate: None,
            description: None,
        }),
        total_frame_count: None,
        duration_us: args.duration.map(|secs| (secs * 1_000_000.0) as i64),
    };

    let interactor = PlanInteractor::new(spec)?;
    let plan = interactor
        .plan(&source, args.input.as_deref())
        .context("Failed to derive output parameters")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", plan.describe());
    }
    Ok(())
}

/// Execute the presets command
pub fn presets(args: PresetsArgs) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(BUILTIN_PRESETS)?);
        return Ok(());
    }
    for preset in BUILTIN_PRESETS {
        println!("{:<12} {:<5} {}", preset.name, preset.container.to_string(), preset.description);
    }
    Ok(())
}

/// Execute the simulate command
pub async fn simulate(args: SimulateArgs, config: &AppConfig, progress: ProgressMode) -> Result<()> {
    let media = SimulatedMedia {
        width: args.width,
        height: args.height,
        framerate: args.fps,
        frame_count: args.frames,
        audio: args.audio.then(SimulatedAudio::default),
        start_offset_us: args.start_offset_ms * 1_000,
        ..SimulatedMedia::default()
    };
    info!(
        "Simulating {} frames of {}x{} at {} fps",
        media.frame_count, media.width, media.height, media.framerate
    );

    let duration_seconds = media.duration_us() as f64 / 1_000_000.0;
    let spec = args
        .settings
        .apply(config.output.clone(), Some(duration_seconds))
        .context("Invalid output settings")?;

    let mut codecs = SimulatedCodecs::with_latency(Duration::from_millis(args.latency_ms));
    if let Some(limit) = args.video_emit_limit {
        codecs.video_encoder = CodecBehavior {
            emit_limit: Some(limit),
            ..codecs.video_encoder.clone()
        };
    }

    let destination: Box<dyn DestinationSink> = match &args.output {
        Some(path) => Box::new(
            FileDestination::create(path, args.overwrite)
                .with_context(|| format!("Cannot write {}", path.display()))?,
        ),
        None => Box::new(MemoryDestination::new()),
    };

    let io = PipelineIo {
        demux: Box::new(SimulatedDemux::new(&media)),
        codecs: Box::new(codecs),
        muxers: Box::new(SimulatedMuxFactory::new(TimestampUnit::Microseconds)),
        destination,
        reporter: progress.reporter(),
    };

    let interactor = TranscodeInteractor::new(config.pipeline.clone(), spec);
    interactor.cancel_on_ctrl_c();
    let report = interactor.execute(io).await.context("Simulated transcode failed")?;
    print_report(&report, args.json)
}

/// Execute the transcode command
#[cfg(feature = "ffmpeg")]
pub async fn transcode(
    args: crate::cli::args::TranscodeArgs,
    config: &AppConfig,
    progress: ProgressMode,
) -> Result<()> {
    use crate::adapters::ffmpeg::{self, FfmpegCodecs, FfmpegDemux, FfmpegMuxFactory};
    use crate::domain::rules::ContainerRules;

    if !args.input.exists() {
        anyhow::bail!("Input file does not exist: {}", args.input.display());
    }
    ffmpeg::init().context("Failed to initialize FFmpeg")?;

    let duration = ffmpeg::probe_duration(&args.input).context("Failed to probe input")?;
    let spec = args
        .settings
        .apply(config.output.clone(), duration)
        .context("Invalid output settings")?;

    let output = match &args.output {
        Some(path) => path.clone(),
        None => {
            let name = ContainerRules::output_file_name(
                &args.input,
                &spec.rate_control,
                ContainerRules::resolve(&spec),
            );
            args.input.with_file_name(name)
        }
    };
    info!("Transcoding {} -> {}", args.input.display(), output.display());

    let destination = FileDestination::create(&output, args.overwrite)
        .with_context(|| format!("Cannot write {}", output.display()))?;
    let io = PipelineIo {
        demux: Box::new(FfmpegDemux::open(&args.input).context("Failed to open input")?),
        codecs: Box::new(FfmpegCodecs::new()),
        muxers: Box::new(FfmpegMuxFactory::new()),
        destination: Box::new(destination),
        reporter: progress.reporter(),
    };

    let interactor = TranscodeInteractor::new(config.pipeline.clone(), spec);
    interactor.cancel_on_ctrl_c();
    let report = interactor.execute(io).await.context("Transcode failed")?;
    print_report(&report, args.json)
}

fn print_report(report: &TranscodeReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    println!("{}", summarize(report));
    Ok(())
}

/// Plain-text job summary
pub fn summarize(report: &TranscodeReport) -> String {
    let mut lines = vec![format!("State:         {}", report.final_state)];
    if let Some(params) = &report.parameters {
        lines.push(format!("Output:        {} {} {}", params.container, params.video.geometry, params.video.codec));
    }
    lines.push(format!(
        "Video chunks:  {}",
        report.chunks_muxed(TrackKind::Video)
    ));
    if report.audio_enabled {
        lines.push(format!("Audio chunks:  {}", report.chunks_muxed(TrackKind::Audio)));
    }
    lines.push(format!("Dropped:       {}", report.counters.dropped));
    lines.push(format!("Warnings:      {}", report.warnings.len()));
    lines.push(format!("Elapsed:       {:.2}s", report.elapsed_ms as f64 / 1000.0));
    lines.join("\n")
}
