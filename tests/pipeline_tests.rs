// Pipeline controller tests against the simulated capabilities

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use transcodex_cli::adapters::simulated::{
    CodecBehavior, MemoryDestination, MuxBehavior, SimulatedCodecs, SimulatedDemux, SimulatedMedia,
    SimulatedMuxFactory,
};
use transcodex_cli::domain::model::*;
use transcodex_cli::engine::completion::CompletionReason;
use transcodex_cli::engine::{PipelineController, PipelineIo, PipelineState, PipelineTuning, TranscodeReport};
use transcodex_cli::error::{TranscodeError, TranscodeResult};
use transcodex_cli::ports::{NullReporter, ProgressReporter};

/// Tuning with short windows so jobs finish quickly
fn fast_tuning() -> PipelineTuning {
    PipelineTuning {
        poll_interval_ms: 10,
        idle_window_ms: 60,
        near_complete_idle_window_ms: 200,
        stall_timeout_ms: 2_000,
        startup_timeout_ms: 2_000,
        progress_interval_ms: 20,
        ..PipelineTuning::default()
    }
}

/// Shared handles into the simulated capabilities of one job
struct Harness {
    codecs: SimulatedCodecs,
    muxers: SimulatedMuxFactory,
    destination: MemoryDestination,
    reporter: Arc<dyn ProgressReporter>,
}

impl Harness {
    fn new() -> Self {
        Self::with_codecs(SimulatedCodecs::with_latency(Duration::from_millis(1)))
    }

    fn with_codecs(codecs: SimulatedCodecs) -> Self {
        Self {
            codecs,
            muxers: SimulatedMuxFactory::new(TimestampUnit::Microseconds),
            destination: MemoryDestination::new(),
            reporter: Arc::new(NullReporter),
        }
    }

    fn io(&self, media: &SimulatedMedia) -> PipelineIo {
        PipelineIo {
            demux: Box::new(SimulatedDemux::new(media)),
            codecs: Box::new(self.codecs.clone()),
            muxers: Box::new(self.muxers.clone()),
            destination: Box::new(self.destination.clone()),
            reporter: Arc::clone(&self.reporter),
        }
    }

    fn controller(&self, media: &SimulatedMedia, tuning: PipelineTuning) -> PipelineController {
        PipelineController::new(tuning, OutputSpec::default(), self.io(media), CancellationToken::new()).unwrap()
    }

    async fn run(&self, media: &SimulatedMedia) -> TranscodeResult<TranscodeReport> {
        self.controller(media, fast_tuning()).run().await
    }

    fn video_timestamps(&self) -> Vec<i64> {
        self.muxers.log().lock().unwrap().video_timestamps.clone()
    }

    fn audio_timestamps(&self) -> Vec<i64> {
        self.muxers.log().lock().unwrap().audio_timestamps.clone()
    }

    fn destination_state(&self) -> (bool, bool) {
        let log = self.destination.log();
        let log = log.lock().unwrap();
        (log.closed, log.aborted)
    }
}

fn video_only(frame_count: u64) -> SimulatedMedia {
    SimulatedMedia {
        frame_count,
        audio: None,
        ..SimulatedMedia::default()
    }
}

#[tokio::test]
async fn test_transcode_muxes_every_frame() {
    let harness = Harness::new();
    let media = SimulatedMedia::default();
    let report = harness.run(&media).await.unwrap();

    assert_eq!(report.final_state, PipelineState::Done);
    assert_eq!(report.chunks_muxed(TrackKind::Video), 300);
    assert_eq!(report.chunks_muxed(TrackKind::Audio), media.audio_frame_count());
    assert!(report.audio_enabled);
    assert_eq!(report.counters.dropped, 0);
    assert!(report.warnings.is_empty());

    let states: Vec<PipelineState> = report.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            PipelineState::DetectingFormat,
            PipelineState::Configuring,
            PipelineState::Transcoding,
            PipelineState::Draining,
            PipelineState::Finalizing,
            PipelineState::Done,
        ]
    );

    assert!(harness.muxers.log().lock().unwrap().finalized);
    assert_eq!(harness.destination_state(), (true, false));
    let log = harness.destination.log();
    assert!(log.lock().unwrap().bytes.starts_with(b"TXSIM1"));
}

#[tokio::test]
async fn test_timestamps_are_zero_based_and_monotonic() {
    let mut harness = Harness::new();
    harness.muxers = SimulatedMuxFactory::new(TimestampUnit::Milliseconds);
    let media = SimulatedMedia {
        start_offset_us: 5_000_000,
        ..SimulatedMedia::default()
    };
    harness.run(&media).await.unwrap();

    let video = harness.video_timestamps();
    let audio = harness.audio_timestamps();
    assert_eq!(video.len(), 300);
    assert_eq!(video[0], 0);
    assert_eq!(audio[0], 0);
    assert!(video.windows(2).all(|w| w[0] <= w[1]));
    assert!(audio.windows(2).all(|w| w[0] <= w[1]));
    // 299 frames of 33_333 us, expressed in milliseconds
    assert_eq!(*video.last().unwrap(), 9_966);
}

#[tokio::test]
async fn test_repeated_readiness_configures_once() {
    let harness = Harness::new();
    let media = SimulatedMedia {
        frame_count: 30,
        ready_signals: 3,
        ..SimulatedMedia::default()
    };
    let report = harness.run(&media).await.unwrap();
    assert_eq!(report.final_state, PipelineState::Done);

    let stats = harness.codecs.stats();
    assert_eq!(harness.muxers.log().lock().unwrap().configs.len(), 1);
    assert_eq!(stats.decoders_created(), 2);
    assert_eq!(stats.encoders_created(), 2);
    assert_eq!(stats.encoder_configures(TrackKind::Video), 1);
    assert_eq!(stats.encoder_configures(TrackKind::Audio), 1);
}

#[tokio::test]
async fn test_finalizes_only_after_late_chunks_are_muxed() {
    let mut codecs = SimulatedCodecs::new();
    codecs.video_encoder = CodecBehavior {
        latency: Duration::from_millis(5),
        flush_returns_early: true,
        ..CodecBehavior::default()
    };
    let harness = Harness::with_codecs(codecs);
    let report = harness.run(&video_only(60)).await.unwrap();

    assert_eq!(report.final_state, PipelineState::Done);
    assert_eq!(report.muxed_at(PipelineState::Finalizing), Some((60, 0)));
    assert_eq!(report.chunks_muxed(TrackKind::Video), 60);
}

#[tokio::test]
async fn test_cancellation_aborts_and_stops_submissions() {
    let harness = Harness::new();
    let media = SimulatedMedia {
        sample_delay: Some(Duration::from_millis(2)),
        ..SimulatedMedia::default()
    };
    let cancel = CancellationToken::new();
    let controller =
        PipelineController::new(fast_tuning(), OutputSpec::default(), harness.io(&media), cancel.clone()).unwrap();
    let mut watcher = controller.subscribe_state();
    let observed = controller.subscribe_state();

    let trigger = tokio::spawn(async move {
        watcher.wait_for(|s| *s == PipelineState::Transcoding).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = controller.run().await;
    trigger.await.unwrap();
    assert!(matches!(result, Err(TranscodeError::Cancelled)));
    assert_eq!(*observed.borrow(), PipelineState::Aborted);
    assert_eq!(harness.destination_state(), (false, true));

    let stats = harness.codecs.stats();
    let submitted = stats.total_submissions();
    assert!(submitted > 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stats.total_submissions(), submitted);
    assert!(!harness.muxers.log().lock().unwrap().finalized);
}

#[tokio::test]
async fn test_video_only_source_creates_no_audio_encoder() {
    let harness = Harness::new();
    let report = harness.run(&video_only(30)).await.unwrap();

    assert!(!report.audio_enabled);
    assert_eq!(harness.codecs.stats().encoders_created(), 1);
    assert!(harness.muxers.log().lock().unwrap().configs[0].audio.is_none());
    assert_eq!(report.chunks_muxed(TrackKind::Audio), 0);
}

#[tokio::test]
async fn test_stalled_encoder_is_forced_complete() {
    let mut codecs = SimulatedCodecs::with_latency(Duration::from_millis(1));
    codecs.video_encoder.emit_limit = Some(95);
    let harness = Harness::with_codecs(codecs);
    let tuning = PipelineTuning {
        stall_timeout_ms: 300,
        ..fast_tuning()
    };
    let report = harness.controller(&video_only(300), tuning).run().await.unwrap();

    assert_eq!(report.final_state, PipelineState::Done);
    assert_eq!(report.chunks_muxed(TrackKind::Video), 95);
    assert!(report.warnings.iter().any(|w| w.contains("Stalled on video")));
    assert!(matches!(
        report.tracks[0].reason,
        Some(CompletionReason::Stalled { below_floor: true, .. })
    ));
    assert_eq!(harness.destination_state(), (true, false));
}

#[tokio::test]
async fn test_audio_configuration_failure_degrades_to_video_only() {
    let mut codecs = SimulatedCodecs::with_latency(Duration::from_millis(1));
    codecs.audio_encoder.fail_configure = true;
    let harness = Harness::with_codecs(codecs);
    let media = SimulatedMedia {
        frame_count: 60,
        ..SimulatedMedia::default()
    };
    let report = harness.run(&media).await.unwrap();

    assert_eq!(report.final_state, PipelineState::Done);
    assert!(!report.audio_enabled);
    assert_eq!(report.chunks_muxed(TrackKind::Video), 60);
    assert_eq!(report.chunks_muxed(TrackKind::Audio), 0);
    assert!(report.warnings.iter().any(|w| w.contains("output has no audio")));
    assert!(harness.muxers.log().lock().unwrap().configs[0].audio.is_none());
}

#[tokio::test]
async fn test_video_configuration_failure_fails_job() {
    let mut codecs = SimulatedCodecs::new();
    codecs.video_encoder.fail_configure = true;
    let harness = Harness::with_codecs(codecs);
    let result = harness.run(&video_only(30)).await;

    assert!(matches!(
        result,
        Err(TranscodeError::CodecConfiguration { track: TrackKind::Video, .. })
    ));
    assert_eq!(harness.destination_state(), (false, true));
}

#[tokio::test]
async fn test_unparseable_source_fails_format_detection() {
    let harness = Harness::new();
    let media = SimulatedMedia {
        corrupt: true,
        ..SimulatedMedia::default()
    };
    let controller = harness.controller(&media, fast_tuning());
    let state = controller.subscribe_state();
    let result = controller.run().await;

    assert!(matches!(result, Err(TranscodeError::FormatDetection { .. })));
    assert_eq!(*state.borrow(), PipelineState::Failed);
    assert_eq!(harness.codecs.stats().decoders_created(), 0);
}

#[tokio::test]
async fn test_capability_closing_mid_job_fails_pipeline() {
    let mut codecs = SimulatedCodecs::with_latency(Duration::from_millis(1));
    codecs.video_decoder.close_after = Some(10);
    let harness = Harness::with_codecs(codecs);
    let result = harness.run(&video_only(60)).await;

    assert!(matches!(result, Err(TranscodeError::PipelineFailed { .. })));
    assert_eq!(harness.destination_state(), (false, true));
}

#[tokio::test]
async fn test_rejected_submissions_are_dropped_and_job_completes() {
    let mut codecs = SimulatedCodecs::with_latency(Duration::from_millis(1));
    codecs.video_decoder.reject_every = Some(50);
    let harness = Harness::with_codecs(codecs);
    let report = harness.run(&video_only(300)).await.unwrap();

    assert_eq!(report.final_state, PipelineState::Done);
    assert_eq!(report.counters.dropped, 6);
    assert_eq!(report.chunks_muxed(TrackKind::Video), 294);
    assert_eq!(report.tracks[0].expected, Some(294));
    assert!(matches!(report.tracks[0].reason, Some(CompletionReason::Idle { .. })));
}

#[tokio::test]
async fn test_swapped_samples_are_reordered() {
    let harness = Harness::new();
    let media = SimulatedMedia {
        swap_adjacent_samples: true,
        ..video_only(60)
    };
    let report = harness.run(&media).await.unwrap();

    let video = harness.video_timestamps();
    assert_eq!(report.counters.dropped, 0);
    assert_eq!(video.len(), 60);
    assert!(video.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_first_video_frame_is_forced_key() {
    let harness = Harness::new();
    harness.run(&video_only(30)).await.unwrap();

    let stats = harness.codecs.stats();
    assert!(stats.first_video_frame_key());
    assert_eq!(stats.key_frame_requests(TrackKind::Video), 1);
    assert_eq!(
        harness.muxers.log().lock().unwrap().first_video_chunk_type,
        Some(ChunkType::Key)
    );
}

#[tokio::test]
async fn test_unknown_frame_count_completes_on_idle() {
    let harness = Harness::new();
    let media = SimulatedMedia {
        report_frame_count: false,
        ..video_only(45)
    };
    let report = harness.run(&media).await.unwrap();

    assert_eq!(report.chunks_muxed(TrackKind::Video), 45);
    assert_eq!(report.tracks[0].expected, None);
    assert!(matches!(report.tracks[0].reason, Some(CompletionReason::Idle { coverage: None })));
}

/// Reporter keeping every event
#[derive(Default)]
struct Recorder(Mutex<Vec<ProgressEvent>>);

impl ProgressReporter for Recorder {
    fn report(&self, event: &ProgressEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn test_progress_ends_at_done() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new();
    harness.reporter = recorder.clone();
    harness.run(&video_only(90)).await.unwrap();

    let events = recorder.0.lock().unwrap();
    assert_eq!(events.first().map(|e| e.stage), Some(ProgressStage::Demuxing));
    let last = events.last().unwrap();
    assert_eq!(last.stage, ProgressStage::Done);
    assert_eq!(last.overall_percent, Some(100.0));

    let overall: Vec<f64> = events.iter().filter_map(|e| e.overall_percent).collect();
    assert!(overall.windows(2).all(|w| w[0] <= w[1] + f64::EPSILON));
}

fn failing_mux(behavior: MuxBehavior) -> SimulatedMuxFactory {
    SimulatedMuxFactory::with_behavior(TimestampUnit::Microseconds, behavior)
}

#[tokio::test]
async fn test_mux_creation_failure_closes_configured_codecs() {
    let mut harness = Harness::new();
    harness.muxers = failing_mux(MuxBehavior {
        fail_create: true,
        ..MuxBehavior::default()
    });
    let media = SimulatedMedia {
        frame_count: 30,
        ..SimulatedMedia::default()
    };
    let result = harness.run(&media).await;

    assert!(matches!(result, Err(TranscodeError::Config { .. })));
    let stats = harness.codecs.stats();
    assert_eq!(stats.decoders_created(), 2);
    assert_eq!(stats.encoders_created(), 2);
    assert_eq!(stats.closed(), 4);
    assert_eq!(harness.destination_state(), (false, true));
}

#[tokio::test]
async fn test_slow_decoder_holds_back_demux() {
    let mut codecs = SimulatedCodecs::new();
    codecs.video_decoder = CodecBehavior::with_latency(Duration::from_secs(5));
    let harness = Harness::with_codecs(codecs);
    let tuning = PipelineTuning {
        max_decode_queue: 5,
        ..fast_tuning()
    };
    let cancel = CancellationToken::new();
    let controller =
        PipelineController::new(tuning, OutputSpec::default(), harness.io(&video_only(120)), cancel.clone()).unwrap();
    let counters = controller.counters();
    let stats = harness.codecs.stats();

    let observe = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let submitted = stats.decode_submissions(TrackKind::Video);
        let demuxed = counters.snapshot().samples_demuxed[TrackKind::Video.index()];
        cancel.cancel();
        (submitted, demuxed)
    };
    let (result, (submitted, demuxed)) = tokio::join!(controller.run(), observe);

    assert!(matches!(result, Err(TranscodeError::Cancelled)));
    assert_eq!(submitted, 5);
    // Only the reorder window is read ahead of the stalled decoder
    assert!(demuxed < 120);
}

#[tokio::test]
async fn test_destination_close_failure_surfaces_as_finalization() {
    let mut harness = Harness::new();
    harness.destination = MemoryDestination::failing_close();
    let controller = harness.controller(&video_only(30), fast_tuning());
    let state = controller.subscribe_state();
    let result = controller.run().await;

    match result {
        Err(TranscodeError::Finalization { message }) => assert!(message.contains("disk full")),
        other => panic!("expected a finalization error, got {:?}", other.map(|r| r.final_state)),
    }
    assert_eq!(*state.borrow(), PipelineState::Failed);
    assert_eq!(harness.destination_state(), (false, true));
}

#[tokio::test]
async fn test_mux_finalize_failure_aborts_destination() {
    let mut harness = Harness::new();
    harness.muxers = failing_mux(MuxBehavior {
        fail_finalize: true,
        ..MuxBehavior::default()
    });
    let result = harness.run(&video_only(30)).await;

    assert!(matches!(result, Err(TranscodeError::Finalization { .. })));
    assert_eq!(harness.destination_state(), (false, true));
}

#[tokio::test]
async fn test_mux_timestamp_regression_fails_job() {
    let mut harness = Harness::new();
    harness.muxers = failing_mux(MuxBehavior {
        misorder_at: Some(10),
        ..MuxBehavior::default()
    });
    let result = harness.run(&video_only(60)).await;

    assert!(matches!(result, Err(TranscodeError::PipelineFailed { .. })));
    assert_eq!(harness.video_timestamps().len(), 9);
    assert!(!harness.muxers.log().lock().unwrap().finalized);
    assert_eq!(harness.destination_state(), (false, true));
}

#[tokio::test]
async fn test_refused_mux_chunks_are_dropped_and_job_completes() {
    let mut harness = Harness::new();
    harness.muxers = failing_mux(MuxBehavior {
        reject_every: Some(10),
        ..MuxBehavior::default()
    });
    let report = harness.run(&video_only(60)).await.unwrap();

    assert_eq!(report.final_state, PipelineState::Done);
    assert_eq!(report.counters.dropped, 6);
    assert_eq!(report.chunks_muxed(TrackKind::Video), 54);
    assert_eq!(report.tracks[0].expected, Some(54));
    assert_eq!(harness.video_timestamps().len(), 54);
    assert_eq!(harness.destination_state(), (true, false));
}
