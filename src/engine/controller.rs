//! Pipeline controller
//!
//! Drives one job from format detection to a finalized output: demuxed
//! samples are reordered and submitted to decoders, decoded frames are
//! forwarded to encoders, and encoded chunks are rebased and handed to the
//! mux sink. All work happens on the task that awaits [`PipelineController::run`];
//! capabilities report their output through channels that the controller
//! drains between steps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::DomainError;
use crate::domain::model::*;
use crate::domain::rules::{DerivedParameters, ParameterDeriver};
use crate::engine::completion::{CompletionDetector, CompletionReason, TrackCompletion};
use crate::engine::counters::{CounterSnapshot, PipelineCounters};
use crate::engine::progress::ProgressTracker;
use crate::engine::state::{PipelineState, StateMachine, StateTransition};
use crate::engine::timestamps::{to_sink_unit, Normalized, ReorderBuffer, TrackClock};
use crate::engine::PipelineTuning;
use crate::error::{TranscodeError, TranscodeResult};
use crate::ports::*;

/// Capabilities a job runs against
pub struct PipelineIo {
    pub demux: Box<dyn DemuxSource>,
    pub codecs: Box<dyn CodecFactory>,
    pub muxers: Box<dyn MuxSinkFactory>,
    pub destination: Box<dyn DestinationSink>,
    pub reporter: Arc<dyn ProgressReporter>,
}

/// Summary of a finished job
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeReport {
    pub final_state: PipelineState,
    pub parameters: Option<DerivedParameters>,
    pub audio_enabled: bool,
    pub counters: CounterSnapshot,
    pub tracks: Vec<TrackCompletion>,
    pub transitions: Vec<StateTransition>,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

impl TranscodeReport {
    pub fn chunks_muxed(&self, kind: TrackKind) -> u64 {
        self.counters.chunks_muxed[kind.index()]
    }

    /// Muxed chunk counts recorded when the job entered `state`
    pub fn muxed_at(&self, state: PipelineState) -> Option<(u64, u64)> {
        self.transitions
            .iter()
            .find(|t| t.to == state)
            .map(|t| (t.video_chunks_muxed, t.audio_chunks_muxed))
    }
}

/// Decoder, encoder and per-track bookkeeping for one elementary stream
struct TrackPipeline {
    kind: TrackKind,
    decoder: Box<dyn DecodeCapability>,
    encoder: Box<dyn EncodeCapability>,
    frames: UnboundedReceiver<DecodedFrame>,
    chunks: UnboundedReceiver<EncodedChunk>,
    reorder: ReorderBuffer,
    clock: TrackClock,
    frames_submitted: u64,
    expected_layout: Option<AudioLayout>,
    layout_mismatch_logged: bool,
}

impl TrackPipeline {
    fn close(&mut self) {
        self.decoder.close();
        self.encoder.close();
        self.frames.close();
        self.chunks.close();
    }
}

fn track_of<'a>(
    video: &'a mut Option<TrackPipeline>,
    audio: &'a mut Option<TrackPipeline>,
    kind: TrackKind,
) -> Option<&'a mut TrackPipeline> {
    match kind {
        TrackKind::Video => video.as_mut(),
        TrackKind::Audio => audio.as_mut(),
    }
}

/// Sleep unless the job is cancelled first
async fn pause(cancel: &CancellationToken, duration: Duration) -> TranscodeResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TranscodeError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Orchestrates one transcode job
pub struct PipelineController {
    tuning: PipelineTuning,
    spec: OutputSpec,
    demux: Box<dyn DemuxSource>,
    codecs: Box<dyn CodecFactory>,
    muxers: Box<dyn MuxSinkFactory>,
    destination: Box<dyn DestinationSink>,
    cancel: CancellationToken,
    state: StateMachine,
    counters: Arc<PipelineCounters>,
    progress: ProgressTracker,
    completion: CompletionDetector,
    video: Option<TrackPipeline>,
    audio: Option<TrackPipeline>,
    mux: Option<Box<dyn MuxSink>>,
    params: Option<DerivedParameters>,
    finalized: bool,
    warnings: Vec<String>,
    started: Instant,
}

impl PipelineController {
    /// Create a controller for one job
    pub fn new(
        tuning: PipelineTuning,
        spec: OutputSpec,
        io: PipelineIo,
        cancel: CancellationToken,
    ) -> TranscodeResult<Self> {
        tuning.validate()?;
        spec.validate().map_err(|e| TranscodeError::Config { message: e.to_string() })?;

        let progress = ProgressTracker::new(
            io.reporter,
            tuning.demux_progress_weight,
            Duration::from_millis(tuning.progress_interval_ms),
        );
        let completion = CompletionDetector::new(&tuning);

        Ok(Self {
            tuning,
            spec,
            demux: io.demux,
            codecs: io.codecs,
            muxers: io.muxers,
            destination: io.destination,
            cancel,
            state: StateMachine::new(),
            counters: PipelineCounters::new(),
            progress,
            completion,
            video: None,
            audio: None,
            mux: None,
            params: None,
            finalized: false,
            warnings: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Observe state changes while the job runs
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Shared counters, readable while the job runs
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    /// Run the job to completion, cancellation or failure
    pub async fn run(mut self) -> TranscodeResult<TranscodeReport> {
        self.started = Instant::now();
        match self.execute().await {
            Ok(()) => {
                let report = self.report();
                info!(
                    "Transcode finished: {} video / {} audio chunks in {} ms",
                    report.chunks_muxed(TrackKind::Video),
                    report.chunks_muxed(TrackKind::Audio),
                    report.elapsed_ms
                );
                Ok(report)
            }
            Err(err) => {
                let target = if err.is_cancelled() {
                    warn!("Transcode cancelled in state {}", self.state.current());
                    PipelineState::Aborted
                } else {
                    error!("Transcode failed in state {}: {}", self.state.current(), err);
                    PipelineState::Failed
                };
                self.teardown(target).await;
                Err(err)
            }
        }
    }

    async fn execute(&mut self) -> TranscodeResult<()> {
        self.transition(PipelineState::DetectingFormat)?;
        self.demux_phase().await?;
        self.drain_phase().await?;
        self.finalize_phase().await
    }

    fn transition(&mut self, next: PipelineState) -> TranscodeResult<()> {
        self.state.transition(next, self.counters.muxed_pair())
    }

    fn check_cancelled(&self) -> TranscodeResult<()> {
        if self.cancel.is_cancelled() {
            Err(TranscodeError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn demux_phase(&mut self) -> TranscodeResult<()> {
        loop {
            self.check_cancelled()?;
            self.pump_outputs().await?;

            if self.backpressured() {
                pause(&self.cancel, self.tuning.backpressure_poll()).await?;
                continue;
            }

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                event = self.demux.next_event() => event,
            };

            match event {
                Ok(DemuxEvent::Ready(descriptor)) => self.on_ready(descriptor)?,
                Ok(DemuxEvent::Sample(sample)) => self.on_sample(sample)?,
                Ok(DemuxEvent::Progress(percent)) => {
                    if self.state.current() == PipelineState::DetectingFormat {
                        self.progress.demux_progress(percent);
                    }
                }
                Ok(DemuxEvent::End) => break,
                Err(e) => {
                    return Err(TranscodeError::FormatDetection { message: e.to_string() });
                }
            }

            self.report_progress(false);
        }

        if self.state.current() == PipelineState::DetectingFormat {
            return Err(TranscodeError::FormatDetection {
                message: "Source ended before its format was detected".to_string(),
            });
        }
        debug!(
            "Demux finished: {} video / {} audio samples",
            self.counters.snapshot().samples_demuxed[0],
            self.counters.snapshot().samples_demuxed[1]
        );
        Ok(())
    }

    fn backpressured(&self) -> bool {
        let limit = self.tuning.max_decode_queue;
        [&self.video, &self.audio]
            .into_iter()
            .flatten()
            .any(|track| track.decoder.queue_depth() >= limit)
    }

    fn on_ready(&mut self, descriptor: SourceDescriptor) -> TranscodeResult<()> {
        if self.state.current() != PipelineState::DetectingFormat {
            debug!("Ignoring repeated readiness signal");
            return Ok(());
        }
        self.transition(PipelineState::Configuring)?;
        self.configure(descriptor)?;
        self.transition(PipelineState::Transcoding)
    }

    fn configure(&mut self, descriptor: SourceDescriptor) -> TranscodeResult<()> {
        let params = ParameterDeriver::derive(&descriptor, &self.spec).map_err(|e| match e {
            DomainError::InvalidFormat(message) => TranscodeError::FormatDetection { message },
            other => TranscodeError::Config { message: other.to_string() },
        })?;
        let source_video = descriptor.video.clone().ok_or_else(|| TranscodeError::FormatDetection {
            message: "Source has no video track".to_string(),
        })?;

        info!(
            "Source {}x{} {} -> {} {} ({})",
            source_video.width,
            source_video.height,
            source_video.codec,
            params.video.geometry,
            params.video.codec,
            params.container
        );
        if params.downscaled {
            warn!("Output exceeds H.264 level 5.0, downscaling to {}", params.video.geometry);
            self.warnings
                .push(format!("Downscaled to {} to fit H.264 level limits", params.video.geometry));
        }

        let video = self
            .build_track(
                TrackKind::Video,
                DecoderConfig::Video(source_video),
                EncoderConfig::Video(params.video.clone()),
                None,
            )
            .map_err(|e| TranscodeError::CodecConfiguration {
                track: TrackKind::Video,
                message: e.to_string(),
            })?;

        let audio = match (&descriptor.audio, &params.audio) {
            (Some(format), Some(config)) => {
                let layout = AudioLayout {
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                };
                match self.build_track(
                    TrackKind::Audio,
                    DecoderConfig::Audio(format.clone()),
                    EncoderConfig::Audio(config.clone()),
                    Some(layout),
                ) {
                    Ok(track) => Some(track),
                    Err(e) => {
                        let err = TranscodeError::CodecConfiguration {
                            track: TrackKind::Audio,
                            message: e.to_string(),
                        };
                        warn!("{}; continuing without audio", err);
                        self.warnings.push(format!("{}; output has no audio", err));
                        None
                    }
                }
            }
            (Some(_), None) => {
                info!("Audio disabled by output spec");
                None
            }
            (None, _) => {
                debug!("Source has no audio track");
                None
            }
        };

        // Owned by the controller from here on so teardown closes them
        self.video = Some(video);
        self.audio = audio;

        let mux_config = params.mux_config(self.audio.is_some());
        let mux = self
            .muxers
            .create(&mux_config, self.destination.as_ref())
            .map_err(|e| TranscodeError::Config {
                message: format!("Mux sink rejected {} output: {}", mux_config.container, e),
            })?;

        self.completion.track(TrackKind::Video, descriptor.total_frame_count);
        if self.audio.is_some() {
            self.completion.track(TrackKind::Audio, None);
        }
        self.progress.set_total_frames(descriptor.total_frame_count);

        self.mux = Some(mux);
        self.params = Some(params);
        Ok(())
    }

    fn build_track(
        &mut self,
        kind: TrackKind,
        decoder_config: DecoderConfig,
        encoder_config: EncoderConfig,
        expected_layout: Option<AudioLayout>,
    ) -> Result<TrackPipeline, DomainError> {
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (chunk_tx, chunks) = mpsc::unbounded_channel();

        let mut decoder = self.codecs.create_decoder(kind, frame_tx)?;
        if let Err(e) = decoder.configure(&decoder_config) {
            decoder.close();
            return Err(e);
        }

        let mut encoder = match self.codecs.create_encoder(kind, chunk_tx) {
            Ok(encoder) => encoder,
            Err(e) => {
                decoder.close();
                return Err(e);
            }
        };
        if let Err(e) = encoder.configure(&encoder_config) {
            decoder.close();
            encoder.close();
            return Err(e);
        }

        Ok(TrackPipeline {
            kind,
            decoder,
            encoder,
            frames,
            chunks,
            reorder: ReorderBuffer::new(self.tuning.reorder_window),
            clock: TrackClock::new(),
            frames_submitted: 0,
            expected_layout,
            layout_mismatch_logged: false,
        })
    }

    fn on_sample(&mut self, sample: EncodedSample) -> TranscodeResult<()> {
        if self.state.current() != PipelineState::Transcoding {
            debug!("Dropping {} sample received before format detection", sample.kind);
            return Ok(());
        }
        let kind = sample.kind;
        let released = match track_of(&mut self.video, &mut self.audio, kind) {
            Some(track) => track.reorder.push(sample),
            None => return Ok(()),
        };
        self.counters.sample_demuxed(kind);
        match released {
            Some(sample) => self.submit_sample(sample),
            None => Ok(()),
        }
    }

    fn submit_sample(&mut self, sample: EncodedSample) -> TranscodeResult<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let kind = sample.kind;
        let Some(track) = track_of(&mut self.video, &mut self.audio, kind) else {
            return Ok(());
        };

        if track.decoder.state() == CodecState::Closed {
            return Err(TranscodeError::PipelineFailed {
                message: format!("{} decoder closed unexpectedly", kind),
            });
        }

        if let Err(e) = track.decoder.decode(sample) {
            if e.is_fatal_for_capability() || track.decoder.state() == CodecState::Closed {
                return Err(TranscodeError::PipelineFailed {
                    message: format!("{} decoder failed: {}", kind, e),
                });
            }
            let err = TranscodeError::TransientSubmission { track: kind, message: e.to_string() };
            warn!("{}", err);
            self.counters.unit_dropped();
            self.completion.expect_fewer(kind);
        }
        Ok(())
    }

    /// Forward every frame and mux every chunk that is ready right now
    async fn pump_outputs(&mut self) -> TranscodeResult<()> {
        for kind in [TrackKind::Video, TrackKind::Audio] {
            loop {
                let frame = match track_of(&mut self.video, &mut self.audio, kind) {
                    Some(track) => track.frames.try_recv().ok(),
                    None => None,
                };
                match frame {
                    Some(frame) => self.forward_frame(frame)?,
                    None => break,
                }
            }
        }

        for kind in [TrackKind::Video, TrackKind::Audio] {
            loop {
                let chunk = match track_of(&mut self.video, &mut self.audio, kind) {
                    Some(track) => track.chunks.try_recv().ok(),
                    None => None,
                };
                match chunk {
                    Some(chunk) => self.mux_chunk(chunk).await?,
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn forward_frame(&mut self, frame: DecodedFrame) -> TranscodeResult<()> {
        let kind = frame.kind;
        self.counters.frame_decoded(kind);
        if self.cancel.is_cancelled() || self.finalized {
            return Ok(());
        }
        let Some(track) = track_of(&mut self.video, &mut self.audio, kind) else {
            return Ok(());
        };

        if let (Some(expected), Some(actual)) = (track.expected_layout, frame.audio_layout) {
            if expected != actual && !track.layout_mismatch_logged {
                warn!(
                    "Decoded audio is {} Hz / {} ch but the source reported {} Hz / {} ch",
                    actual.sample_rate, actual.channels, expected.sample_rate, expected.channels
                );
                track.layout_mismatch_logged = true;
            }
        }

        match track.encoder.state() {
            CodecState::Configured => {}
            CodecState::Closed => {
                return Err(TranscodeError::PipelineFailed {
                    message: format!("{} encoder closed unexpectedly", kind),
                });
            }
            CodecState::Unconfigured => {
                debug!("Dropping {} frame for unconfigured encoder", kind);
                return Ok(());
            }
        }

        let options = EncodeOptions {
            key_frame: kind == TrackKind::Video && track.frames_submitted == 0,
        };
        match track.encoder.encode(frame, options) {
            Ok(()) => {
                track.frames_submitted += 1;
                Ok(())
            }
            Err(e) if e.is_fatal_for_capability() || track.encoder.state() == CodecState::Closed => {
                Err(TranscodeError::PipelineFailed {
                    message: format!("{} encoder failed: {}", kind, e),
                })
            }
            Err(e) => {
                let err = TranscodeError::TransientSubmission { track: kind, message: e.to_string() };
                warn!("{}", err);
                self.counters.unit_dropped();
                self.completion.expect_fewer(kind);
                Ok(())
            }
        }
    }

    async fn mux_chunk(&mut self, chunk: EncodedChunk) -> TranscodeResult<()> {
        let kind = chunk.kind;
        if self.finalized {
            debug!("Ignoring {} chunk after finalization", kind);
            return Ok(());
        }
        self.counters.chunk_encoded(kind);
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let (Some(mux), Some(track)) = (self.mux.as_mut(), track_of(&mut self.video, &mut self.audio, kind))
        else {
            return Ok(());
        };

        let (timestamp, duration) = match track.clock.normalize(chunk.timestamp_us, chunk.duration_us) {
            Normalized::Accepted { timestamp_us, duration_us } => {
                to_sink_unit(mux.timestamp_unit(), timestamp_us, duration_us)
            }
            Normalized::OutOfOrder { timestamp_us, last_us } => {
                warn!(
                    "Dropping {} chunk at {} us, behind previous chunk at {} us",
                    kind, timestamp_us, last_us
                );
                self.counters.unit_dropped();
                self.completion.expect_fewer(kind);
                return Ok(());
            }
        };

        let mux_chunk = MuxChunk {
            kind,
            chunk_type: chunk.chunk_type,
            timestamp,
            duration,
            data: chunk.data,
            decoder_config: chunk.decoder_config,
        };

        let result = {
            let _pending = self.counters.begin_write(kind);
            match kind {
                TrackKind::Video => mux.add_video_chunk(mux_chunk, self.destination.as_mut()).await,
                TrackKind::Audio => mux.add_audio_chunk(mux_chunk, self.destination.as_mut()).await,
            }
        };

        match result {
            Ok(()) => {
                self.counters.chunk_muxed(kind);
                self.completion.observe_chunk(kind, Instant::now());
                Ok(())
            }
            Err(e) if e.is_timestamp_ordering() => Err(TranscodeError::PipelineFailed {
                message: format!("Mux sink rejected {} chunk: {}", kind, e),
            }),
            Err(e) => {
                warn!("Mux sink dropped {} chunk: {}", kind, e);
                self.counters.unit_dropped();
                self.completion.expect_fewer(kind);
                Ok(())
            }
        }
    }

    fn report_progress(&mut self, force: bool) {
        if matches!(
            self.state.current(),
            PipelineState::Transcoding | PipelineState::Draining
        ) {
            self.progress.encode_progress(
                self.counters.chunks_encoded(TrackKind::Video),
                self.counters.frames_decoded(TrackKind::Video),
                force,
            );
        }
    }

    async fn drain_phase(&mut self) -> TranscodeResult<()> {
        for kind in [TrackKind::Video, TrackKind::Audio] {
            loop {
                let next = track_of(&mut self.video, &mut self.audio, kind).and_then(|t| t.reorder.pop());
                match next {
                    Some(sample) => self.submit_sample(sample)?,
                    None => break,
                }
            }
            if let Some(track) = track_of(&mut self.video, &mut self.audio, kind) {
                let late = track.reorder.late_samples();
                if late > 0 {
                    warn!("{} {} samples arrived beyond the reorder window", late, track.kind);
                }
            }
        }

        self.transition(PipelineState::Draining)?;
        self.completion.begin_drain(Instant::now());

        for kind in [TrackKind::Video, TrackKind::Audio] {
            if let Some(track) = track_of(&mut self.video, &mut self.audio, kind) {
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                    result = track.decoder.flush() => result,
                };
                if let Err(e) = result {
                    warn!("{} decoder flush failed: {}", kind, e);
                }
            }
            self.pump_outputs().await?;
        }

        for kind in [TrackKind::Video, TrackKind::Audio] {
            if let Some(track) = track_of(&mut self.video, &mut self.audio, kind) {
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                    result = track.encoder.flush() => result,
                };
                if let Err(e) = result {
                    warn!("{} encoder flush failed: {}", kind, e);
                }
            }
        }

        let mut ticker = tokio::time::interval(self.tuning.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            self.pump_outputs().await?;
            self.report_progress(false);
            if self.completion.evaluate(Instant::now()) {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                _ = ticker.tick() => {}
            }
        }

        self.record_completion();
        Ok(())
    }

    fn record_completion(&mut self) {
        for track in self.completion.tracks() {
            match track.reason {
                Some(CompletionReason::Stalled { coverage, below_floor }) => {
                    let err = TranscodeError::StallTimeout {
                        track: track.kind,
                        muxed: track.muxed,
                        expected: track.expected,
                    };
                    if below_floor {
                        error!("{}; coverage {:.1}% is below the floor", err, coverage.unwrap_or(0.0) * 100.0);
                    } else {
                        warn!("{}", err);
                    }
                    self.warnings.push(err.to_string());
                }
                Some(CompletionReason::StartupTimeout) => {
                    warn!("{} encoder produced no output", track.kind);
                    self.warnings.push(format!("{} track produced no output", track.kind));
                }
                Some(CompletionReason::Idle { coverage: Some(c) }) if c < 1.0 => {
                    info!(
                        "{} track completed at {:.2}% coverage ({} of {:?})",
                        track.kind,
                        c * 100.0,
                        track.muxed,
                        track.expected
                    );
                }
                _ => {}
            }
        }
    }

    async fn finalize_phase(&mut self) -> TranscodeResult<()> {
        self.transition(PipelineState::Finalizing)?;
        self.progress.finalizing();
        self.finalized = true;

        for track in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            track.close();
        }

        if let Some(mux) = self.mux.as_mut() {
            mux.finalize(self.destination.as_mut())
                .await
                .map_err(|e| TranscodeError::Finalization { message: e.to_string() })?;
        }
        self.destination
            .close()
            .await
            .map_err(|e| TranscodeError::Finalization { message: e.to_string() })?;

        self.transition(PipelineState::Done)?;
        self.progress.done();
        Ok(())
    }

    async fn teardown(&mut self, target: PipelineState) {
        if let Err(e) = self.transition(target) {
            debug!("{}", e);
        }
        for track in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            track.close();
        }
        if let Err(e) = self.destination.abort().await {
            warn!("Failed to abort destination: {}", e);
        }
    }

    fn report(&self) -> TranscodeReport {
        TranscodeReport {
            final_state: self.state.current(),
            parameters: self.params.clone(),
            audio_enabled: self.audio.is_some(),
            counters: self.counters.snapshot(),
            tracks: self.completion.tracks().to_vec(),
            transitions: self.state.history().to_vec(),
            warnings: self.warnings.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
