// Simulated adapter - In-memory demux, codec and mux capabilities
//
// Used by the `simulate` command for dry runs and by the test suite. Codec
// latency, startup delay, early-resolving flushes, lost output and failures
// can all be injected through `CodecBehavior`. `MuxBehavior` and
// `MemoryDestination::failing_close` do the same for the output side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::Instant;

use crate::domain::errors::*;
use crate::domain::model::*;
use crate::ports::*;

/// Samples per AAC frame
const AUDIO_FRAME_SAMPLES: u64 = 1024;

/// Audio track of a simulated source
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedAudio {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
}

impl Default for SimulatedAudio {
    fn default() -> Self {
        Self {
            codec: DEFAULT_AUDIO_CODEC.to_string(),
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// Description of a synthetic source
#[derive(Debug, Clone)]
pub struct SimulatedMedia {
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub frame_count: u64,
    pub video_codec: String,
    pub audio: Option<SimulatedAudio>,
    /// Timestamp of the first sample
    pub start_offset_us: i64,
    /// Whether the descriptor carries the frame count
    pub report_frame_count: bool,
    /// How many times readiness is signalled
    pub ready_signals: usize,
    /// Swap neighbouring video samples to exercise reordering
    pub swap_adjacent_samples: bool,
    /// Delay before each sample is delivered
    pub sample_delay: Option<Duration>,
    /// Fail format detection with an unparseable-container error
    pub corrupt: bool,
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30.0,
            frame_count: 300,
            video_codec: "avc1.64001f".to_string(),
            audio: Some(SimulatedAudio::default()),
            start_offset_us: 0,
            report_frame_count: true,
            ready_signals: 1,
            swap_adjacent_samples: false,
            sample_delay: None,
            corrupt: false,
        }
    }
}

impl SimulatedMedia {
    pub fn frame_duration_us(&self) -> i64 {
        (1_000_000.0 / self.framerate).round() as i64
    }

    pub fn duration_us(&self) -> i64 {
        self.frame_count as i64 * self.frame_duration_us()
    }

    /// Number of audio frames covering the video duration
    pub fn audio_frame_count(&self) -> u64 {
        match &self.audio {
            Some(audio) => {
                let samples = self.duration_us() as u128 * audio.sample_rate as u128 / 1_000_000;
                (samples as u64).div_ceil(AUDIO_FRAME_SAMPLES)
            }
            None => 0,
        }
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            video: Some(VideoFormat {
                codec: self.video_codec.clone(),
                width: self.width,
                height: self.height,
                framerate: Some(self.framerate),
                bitrate: Some(8_000_000),
                description: Some(vec![0x01, 0x64, 0x00, 0x1f]),
            }),
            audio: self.audio.as_ref().map(|a| AudioFormat {
                codec: a.codec.clone(),
                sample_rate: a.sample_rate,
                channels: a.channels,
                bitrate: Some(128_000),
                description: Some(vec![0x11, 0x90]),
            }),
            total_frame_count: self.report_frame_count.then_some(self.frame_count),
            duration_us: Some(self.duration_us()),
        }
    }

    /// Samples of both tracks interleaved by timestamp
    fn samples(&self) -> Vec<EncodedSample> {
        let frame_us = self.frame_duration_us();
        let mut video: Vec<EncodedSample> = (0..self.frame_count)
            .map(|i| EncodedSample {
                kind: TrackKind::Video,
                chunk_type: if i % 60 == 0 { ChunkType::Key } else { ChunkType::Delta },
                timestamp_us: self.start_offset_us + i as i64 * frame_us,
                decode_timestamp_us: None,
                duration_us: frame_us,
                data: (i as u32).to_le_bytes().to_vec(),
            })
            .collect();
        if self.swap_adjacent_samples {
            for pair in video.chunks_mut(2) {
                pair.reverse();
            }
        }

        let audio: Vec<EncodedSample> = match &self.audio {
            Some(a) => {
                let frame_us = (AUDIO_FRAME_SAMPLES * 1_000_000 / a.sample_rate as u64) as i64;
                (0..self.audio_frame_count())
                    .map(|i| EncodedSample {
                        kind: TrackKind::Audio,
                        chunk_type: ChunkType::Key,
                        timestamp_us: self.start_offset_us + i as i64 * frame_us,
                        decode_timestamp_us: None,
                        duration_us: frame_us,
                        data: (i as u32).to_le_bytes().to_vec(),
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        let mut merged = Vec::with_capacity(video.len() + audio.len());
        let (mut v, mut a) = (video.into_iter().peekable(), audio.into_iter().peekable());
        loop {
            let take_video = match (v.peek(), a.peek()) {
                (Some(vs), Some(as_)) => vs.timestamp_us <= as_.timestamp_us,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_video { v.next() } else { a.next() };
            merged.extend(next);
        }
        merged
    }
}

/// Demux source replaying a [`SimulatedMedia`]
pub struct SimulatedDemux {
    events: VecDeque<DemuxEvent>,
    sample_delay: Option<Duration>,
    corrupt: bool,
}

impl SimulatedDemux {
    pub fn new(media: &SimulatedMedia) -> Self {
        let mut events = VecDeque::new();
        for percent in [25.0, 50.0, 100.0] {
            events.push_back(DemuxEvent::Progress(percent));
        }
        let descriptor = media.descriptor();
        for _ in 0..media.ready_signals.max(1) {
            events.push_back(DemuxEvent::Ready(descriptor.clone()));
        }
        events.extend(media.samples().into_iter().map(DemuxEvent::Sample));
        events.push_back(DemuxEvent::End);
        Self {
            events,
            sample_delay: media.sample_delay,
            corrupt: media.corrupt,
        }
    }
}

#[async_trait]
impl DemuxSource for SimulatedDemux {
    async fn next_event(&mut self) -> Result<DemuxEvent, DomainError> {
        if self.corrupt {
            return Err(DomainError::InvalidFormat("No recognizable container header".to_string()));
        }
        if let (Some(delay), Some(DemuxEvent::Sample(_))) = (self.sample_delay, self.events.front()) {
            tokio::time::sleep(delay).await;
        }
        Ok(self.events.pop_front().unwrap_or(DemuxEvent::End))
    }
}

/// Failure and timing injection for one simulated codec
#[derive(Debug, Clone, Default)]
pub struct CodecBehavior {
    /// Time between submission and output
    pub latency: Duration,
    /// Extra delay before the first output after creation
    pub startup_delay: Duration,
    /// Resolve `flush` without waiting for queued work
    pub flush_returns_early: bool,
    /// Stop producing output after this many units
    pub emit_limit: Option<u64>,
    /// Reject `configure`
    pub fail_configure: bool,
    /// Close itself once this many units were submitted
    pub close_after: Option<u64>,
    /// Reject every n-th submission with a transient error
    pub reject_every: Option<u64>,
    /// Report this layout on decoded audio instead of the configured one
    pub audio_layout_override: Option<AudioLayout>,
}

impl CodecBehavior {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }
}

/// Counters shared by every simulated codec of one factory
#[derive(Debug, Default)]
pub struct SimulationStats {
    decoders_created: AtomicU64,
    encoders_created: AtomicU64,
    encoder_configures: [AtomicU64; 2],
    decode_submissions: [AtomicU64; 2],
    encode_submissions: [AtomicU64; 2],
    key_frame_requests: [AtomicU64; 2],
    first_video_frame_key: AtomicBool,
    closed: AtomicU64,
}

impl SimulationStats {
    pub fn decoders_created(&self) -> u64 {
        self.decoders_created.load(Ordering::SeqCst)
    }

    pub fn encoders_created(&self) -> u64 {
        self.encoders_created.load(Ordering::SeqCst)
    }

    pub fn encoder_configures(&self, kind: TrackKind) -> u64 {
        self.encoder_configures[kind.index()].load(Ordering::SeqCst)
    }

    pub fn decode_submissions(&self, kind: TrackKind) -> u64 {
        self.decode_submissions[kind.index()].load(Ordering::SeqCst)
    }

    pub fn encode_submissions(&self, kind: TrackKind) -> u64 {
        self.encode_submissions[kind.index()].load(Ordering::SeqCst)
    }

    /// Total decode and encode submissions across tracks
    pub fn total_submissions(&self) -> u64 {
        [TrackKind::Video, TrackKind::Audio]
            .iter()
            .map(|k| self.decode_submissions(*k) + self.encode_submissions(*k))
            .sum()
    }

    pub fn key_frame_requests(&self, kind: TrackKind) -> u64 {
        self.key_frame_requests[kind.index()].load(Ordering::SeqCst)
    }

    /// Whether the first video frame submitted was flagged as a keyframe
    pub fn first_video_frame_key(&self) -> bool {
        self.first_video_frame_key.load(Ordering::SeqCst)
    }

    /// Codecs closed by the pipeline
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Sequential worker delivering transformed items at their deadlines
struct Worker<I> {
    tx: Option<UnboundedSender<(Instant, I)>>,
    in_flight: Arc<AtomicUsize>,
}

impl<I: Send + 'static> Worker<I> {
    fn spawn<O, F>(output: UnboundedSender<O>, mut transform: F) -> Self
    where
        O: Send + 'static,
        F: FnMut(I) -> Option<O> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, I)>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&in_flight);
        tokio::spawn(async move {
            // Once the receiver is gone, queued items are discarded but still counted down
            let mut delivering = true;
            while let Some((deadline, item)) = rx.recv().await {
                if delivering {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(out) = transform(item) {
                        delivering = output.send(out).is_ok();
                    }
                }
                counter.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Self {
            tx: Some(tx),
            in_flight,
        }
    }

    fn submit(&self, deadline: Instant, item: I) -> Result<(), DomainError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| DomainError::CapabilityClosed("worker stopped".to_string()))?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tx.send((deadline, item)).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            DomainError::CapabilityClosed("worker stopped".to_string())
        })
    }

    fn depth(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn drain(&self) {
        while self.depth() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn stop(&mut self) {
        self.tx = None;
    }
}

/// Shared lifecycle checks of simulated decoders and encoders
struct Lifecycle {
    kind: TrackKind,
    behavior: CodecBehavior,
    state: CodecState,
    submissions: u64,
    ready_at: Instant,
}

impl Lifecycle {
    fn new(kind: TrackKind, behavior: CodecBehavior) -> Self {
        let ready_at = Instant::now() + behavior.startup_delay;
        Self {
            kind,
            behavior,
            state: CodecState::Unconfigured,
            submissions: 0,
            ready_at,
        }
    }

    fn configure(&mut self) -> Result<(), DomainError> {
        match self.state {
            CodecState::Configured => {
                return Err(DomainError::Configuration(format!("{} codec already configured", self.kind)));
            }
            CodecState::Closed => {
                return Err(DomainError::CapabilityClosed(format!("{} codec is closed", self.kind)));
            }
            CodecState::Unconfigured => {}
        }
        if self.behavior.fail_configure {
            self.state = CodecState::Closed;
            return Err(DomainError::Configuration(format!(
                "{} configuration not supported",
                self.kind
            )));
        }
        self.state = CodecState::Configured;
        Ok(())
    }

    /// Validate a submission and return the delivery deadline
    fn admit(&mut self) -> Result<Instant, DomainError> {
        match self.state {
            CodecState::Configured => {}
            CodecState::Closed => {
                return Err(DomainError::CapabilityClosed(format!("{} codec is closed", self.kind)));
            }
            CodecState::Unconfigured => {
                return Err(DomainError::Submission(format!("{} codec is not configured", self.kind)));
            }
        }
        self.submissions += 1;
        if let Some(limit) = self.behavior.close_after {
            if self.submissions > limit {
                self.state = CodecState::Closed;
                return Err(DomainError::CapabilityClosed(format!(
                    "{} codec closed after {} units",
                    self.kind, limit
                )));
            }
        }
        if let Some(n) = self.behavior.reject_every {
            if n > 0 && self.submissions % n == 0 {
                return Err(DomainError::Submission(format!(
                    "{} unit {} rejected",
                    self.kind, self.submissions
                )));
            }
        }
        Ok((Instant::now() + self.behavior.latency).max(self.ready_at))
    }
}

/// Simulated decode capability
pub struct SimulatedDecoder {
    lifecycle: Lifecycle,
    output: Option<UnboundedSender<DecodedFrame>>,
    worker: Option<Worker<EncodedSample>>,
    stats: Arc<SimulationStats>,
}

#[async_trait]
impl DecodeCapability for SimulatedDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DomainError> {
        let layout = match (config, self.lifecycle.kind) {
            (DecoderConfig::Video(_), TrackKind::Video) => None,
            (DecoderConfig::Audio(format), TrackKind::Audio) => Some(
                self.lifecycle.behavior.audio_layout_override.unwrap_or(AudioLayout {
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                }),
            ),
            _ => {
                return Err(DomainError::Configuration(
                    "Decoder config does not match the track kind".to_string(),
                ))
            }
        };
        self.lifecycle.configure()?;

        let output = self
            .output
            .take()
            .ok_or_else(|| DomainError::Internal("decoder output already taken".to_string()))?;
        let kind = self.lifecycle.kind;
        self.worker = Some(Worker::spawn(output, move |sample: EncodedSample| {
            Some(DecodedFrame {
                kind,
                timestamp_us: sample.timestamp_us,
                duration_us: sample.duration_us,
                audio_layout: layout,
                payload: Box::new(sample.data),
            })
        }));
        Ok(())
    }

    fn decode(&mut self, sample: EncodedSample) -> Result<(), DomainError> {
        self.stats.decode_submissions[self.lifecycle.kind.index()].fetch_add(1, Ordering::SeqCst);
        let deadline = self.lifecycle.admit()?;
        match &self.worker {
            Some(worker) => worker.submit(deadline, sample),
            None => Err(DomainError::Internal("decoder worker missing".to_string())),
        }
    }

    async fn flush(&mut self) -> Result<(), DomainError> {
        if self.lifecycle.behavior.flush_returns_early {
            return Ok(());
        }
        if let Some(worker) = &self.worker {
            worker.drain().await;
        }
        Ok(())
    }

    fn state(&self) -> CodecState {
        self.lifecycle.state
    }

    fn queue_depth(&self) -> usize {
        self.worker.as_ref().map_or(0, Worker::depth)
    }

    fn close(&mut self) {
        if self.lifecycle.state != CodecState::Closed {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        self.lifecycle.state = CodecState::Closed;
        if let Some(worker) = self.worker.as_mut() {
            worker.stop();
        }
    }
}

/// Simulated encode capability
pub struct SimulatedEncoder {
    lifecycle: Lifecycle,
    output: Option<UnboundedSender<EncodedChunk>>,
    worker: Option<Worker<(DecodedFrame, EncodeOptions)>>,
    stats: Arc<SimulationStats>,
}

#[async_trait]
impl EncodeCapability for SimulatedEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), DomainError> {
        let kind = self.lifecycle.kind;
        self.stats.encoder_configures[kind.index()].fetch_add(1, Ordering::SeqCst);
        let gop = match (config, kind) {
            (EncoderConfig::Video(video), TrackKind::Video) => video.gop_size.max(1) as u64,
            (EncoderConfig::Audio(_), TrackKind::Audio) => 1,
            _ => {
                return Err(DomainError::Configuration(
                    "Encoder config does not match the track kind".to_string(),
                ))
            }
        };
        self.lifecycle.configure()?;

        let output = self
            .output
            .take()
            .ok_or_else(|| DomainError::Internal("encoder output already taken".to_string()))?;
        let emit_limit = self.lifecycle.behavior.emit_limit;
        let mut emitted: u64 = 0;
        self.worker = Some(Worker::spawn(output, move |(frame, options): (DecodedFrame, EncodeOptions)| {
            if emit_limit.map_or(false, |limit| emitted >= limit) {
                return None;
            }
            let key = options.key_frame || emitted % gop == 0;
            let chunk = EncodedChunk {
                kind,
                chunk_type: if key { ChunkType::Key } else { ChunkType::Delta },
                timestamp_us: frame.timestamp_us,
                duration_us: frame.duration_us,
                data: vec![if key { 0x65 } else { 0x41 }; 24],
                decoder_config: (emitted == 0).then(|| vec![0x01, 0x4d, 0x00, 0x1f]),
            };
            emitted += 1;
            Some(chunk)
        }));
        Ok(())
    }

    fn encode(&mut self, frame: DecodedFrame, options: EncodeOptions) -> Result<(), DomainError> {
        let kind = self.lifecycle.kind;
        let index = kind.index();
        if self.stats.encode_submissions[index].fetch_add(1, Ordering::SeqCst) == 0 && kind == TrackKind::Video {
            self.stats.first_video_frame_key.store(options.key_frame, Ordering::SeqCst);
        }
        if options.key_frame {
            self.stats.key_frame_requests[index].fetch_add(1, Ordering::SeqCst);
        }
        let deadline = self.lifecycle.admit()?;
        match &self.worker {
            Some(worker) => worker.submit(deadline, (frame, options)),
            None => Err(DomainError::Internal("encoder worker missing".to_string())),
        }
    }

    async fn flush(&mut self) -> Result<(), DomainError> {
        if self.lifecycle.behavior.flush_returns_early {
            return Ok(());
        }
        if let Some(worker) = &self.worker {
            worker.drain().await;
        }
        Ok(())
    }

    fn state(&self) -> CodecState {
        self.lifecycle.state
    }

    fn queue_depth(&self) -> usize {
        self.worker.as_ref().map_or(0, Worker::depth)
    }

    fn close(&mut self) {
        if self.lifecycle.state != CodecState::Closed {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        self.lifecycle.state = CodecState::Closed;
        if let Some(worker) = self.worker.as_mut() {
            worker.stop();
        }
    }
}

/// Factory for simulated codecs with per-role behavior
#[derive(Debug, Clone, Default)]
pub struct SimulatedCodecs {
    pub video_decoder: CodecBehavior,
    pub video_encoder: CodecBehavior,
    pub audio_decoder: CodecBehavior,
    pub audio_encoder: CodecBehavior,
    stats: Arc<SimulationStats>,
}

impl SimulatedCodecs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same latency for every codec
    pub fn with_latency(latency: Duration) -> Self {
        let behavior = CodecBehavior::with_latency(latency);
        Self {
            video_decoder: behavior.clone(),
            video_encoder: behavior.clone(),
            audio_decoder: behavior.clone(),
            audio_encoder: behavior,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<SimulationStats> {
        Arc::clone(&self.stats)
    }
}

impl CodecFactory for SimulatedCodecs {
    fn create_decoder(
        &mut self,
        kind: TrackKind,
        output: UnboundedSender<DecodedFrame>,
    ) -> Result<Box<dyn DecodeCapability>, DomainError> {
        self.stats.decoders_created.fetch_add(1, Ordering::SeqCst);
        let behavior = match kind {
            TrackKind::Video => self.video_decoder.clone(),
            TrackKind::Audio => self.audio_decoder.clone(),
        };
        Ok(Box::new(SimulatedDecoder {
            lifecycle: Lifecycle::new(kind, behavior),
            output: Some(output),
            worker: None,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn create_encoder(
        &mut self,
        kind: TrackKind,
        output: UnboundedSender<EncodedChunk>,
    ) -> Result<Box<dyn EncodeCapability>, DomainError> {
        self.stats.encoders_created.fetch_add(1, Ordering::SeqCst);
        let behavior = match kind {
            TrackKind::Video => self.video_encoder.clone(),
            TrackKind::Audio => self.audio_encoder.clone(),
        };
        Ok(Box::new(SimulatedEncoder {
            lifecycle: Lifecycle::new(kind, behavior),
            output: Some(output),
            worker: None,
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// What a memory mux sink received
#[derive(Debug, Default)]
pub struct MuxLog {
    pub configs: Vec<MuxConfig>,
    pub video_timestamps: Vec<i64>,
    pub audio_timestamps: Vec<i64>,
    pub first_video_chunk_type: Option<ChunkType>,
    pub finalized: bool,
}

/// Failure injection for memory mux sinks
#[derive(Debug, Clone, Default)]
pub struct MuxBehavior {
    /// Reject sink creation
    pub fail_create: bool,
    /// Refuse every n-th chunk with a recoverable I/O error
    pub reject_every: Option<u64>,
    /// Report a timestamp regression on the n-th chunk, counted across tracks
    pub misorder_at: Option<u64>,
    /// Fail `finalize`
    pub fail_finalize: bool,
}

/// Factory for [`MemoryMux`] sinks sharing one log
#[derive(Clone)]
pub struct SimulatedMuxFactory {
    unit: TimestampUnit,
    pub behavior: MuxBehavior,
    log: Arc<Mutex<MuxLog>>,
}

impl SimulatedMuxFactory {
    pub fn new(unit: TimestampUnit) -> Self {
        Self::with_behavior(unit, MuxBehavior::default())
    }

    pub fn with_behavior(unit: TimestampUnit, behavior: MuxBehavior) -> Self {
        Self {
            unit,
            behavior,
            log: Arc::default(),
        }
    }

    pub fn log(&self) -> Arc<Mutex<MuxLog>> {
        Arc::clone(&self.log)
    }
}

impl MuxSinkFactory for SimulatedMuxFactory {
    fn create(
        &mut self,
        config: &MuxConfig,
        _destination: &dyn DestinationSink,
    ) -> Result<Box<dyn MuxSink>, DomainError> {
        if self.behavior.fail_create {
            return Err(DomainError::Configuration(format!("{} output not supported", config.container)));
        }
        if let Ok(mut log) = self.log.lock() {
            log.configs.push(config.clone());
        }
        Ok(Box::new(MemoryMux {
            unit: self.unit,
            config: config.clone(),
            behavior: self.behavior.clone(),
            log: Arc::clone(&self.log),
            header_written: false,
            finalized: false,
            received: 0,
            last: [None, None],
            counts: [0, 0],
        }))
    }
}

/// Mux sink writing a simple length-prefixed record stream.
///
/// Layout: `TXSIM1`, a little-endian u32 length and the JSON track
/// configuration, then one record per chunk (track, key flag, timestamp,
/// duration, payload length, payload), then `TXEND` and the chunk counts.
pub struct MemoryMux {
    unit: TimestampUnit,
    config: MuxConfig,
    behavior: MuxBehavior,
    log: Arc<Mutex<MuxLog>>,
    header_written: bool,
    finalized: bool,
    received: u64,
    last: [Option<i64>; 2],
    counts: [u64; 2],
}

impl MemoryMux {
    async fn write_header(&mut self, destination: &mut dyn DestinationSink) -> Result<(), DomainError> {
        if self.header_written {
            return Ok(());
        }
        let config = serde_json::to_vec(&self.config).map_err(|e| DomainError::Internal(e.to_string()))?;
        let mut header = b"TXSIM1".to_vec();
        header.extend_from_slice(&(config.len() as u32).to_le_bytes());
        header.extend_from_slice(&config);
        destination.write(&header).await?;
        self.header_written = true;
        Ok(())
    }

    async fn add_chunk(&mut self, chunk: MuxChunk, destination: &mut dyn DestinationSink) -> Result<(), DomainError> {
        if self.finalized {
            return Err(DomainError::Internal("mux already finalized".to_string()));
        }
        if chunk.kind == TrackKind::Audio && self.config.audio.is_none() {
            return Err(DomainError::BadArgs("mux has no audio track".to_string()));
        }
        self.received += 1;
        if self.behavior.misorder_at == Some(self.received) {
            return Err(DomainError::TimestampOrdering(format!(
                "{} chunk {} went backwards",
                chunk.kind, self.received
            )));
        }
        if let Some(n) = self.behavior.reject_every {
            if n > 0 && self.received % n == 0 {
                return Err(DomainError::Io(format!("{} chunk {} refused", chunk.kind, self.received)));
            }
        }
        let index = chunk.kind.index();
        if let Some(last) = self.last[index] {
            if chunk.timestamp < last {
                return Err(DomainError::TimestampOrdering(format!(
                    "{} timestamp {} after {}",
                    chunk.kind, chunk.timestamp, last
                )));
            }
        }
        self.write_header(destination).await?;

        let mut record = Vec::with_capacity(chunk.data.len() + 22);
        record.push(index as u8);
        record.push(chunk.chunk_type.is_key() as u8);
        record.extend_from_slice(&chunk.timestamp.to_le_bytes());
        record.extend_from_slice(&chunk.duration.to_le_bytes());
        record.extend_from_slice(&(chunk.data.len() as u32).to_le_bytes());
        record.extend_from_slice(&chunk.data);
        destination.write(&record).await?;

        self.last[index] = Some(chunk.timestamp);
        self.counts[index] += 1;
        if let Ok(mut log) = self.log.lock() {
            match chunk.kind {
                TrackKind::Video => {
                    log.first_video_chunk_type.get_or_insert(chunk.chunk_type);
                    log.video_timestamps.push(chunk.timestamp);
                }
                TrackKind::Audio => log.audio_timestamps.push(chunk.timestamp),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MuxSink for MemoryMux {
    fn timestamp_unit(&self) -> TimestampUnit {
        self.unit
    }

    async fn add_video_chunk(
        &mut self,
        chunk: MuxChunk,
        destination: &mut dyn DestinationSink,
    ) -> Result<(), DomainError> {
        self.add_chunk(chunk, destination).await
    }

    async fn add_audio_chunk(
        &mut self,
        chunk: MuxChunk,
        destination: &mut dyn DestinationSink,
    ) -> Result<(), DomainError> {
        self.add_chunk(chunk, destination).await
    }

    async fn finalize(&mut self, destination: &mut dyn DestinationSink) -> Result<(), DomainError> {
        if self.finalized {
            return Err(DomainError::Internal("mux already finalized".to_string()));
        }
        if self.behavior.fail_finalize {
            return Err(DomainError::Io("trailer could not be written".to_string()));
        }
        self.write_header(destination).await?;
        let mut trailer = b"TXEND".to_vec();
        trailer.extend_from_slice(&self.counts[0].to_le_bytes());
        trailer.extend_from_slice(&self.counts[1].to_le_bytes());
        destination.write(&trailer).await?;
        self.finalized = true;
        if let Ok(mut log) = self.log.lock() {
            log.finalized = true;
        }
        Ok(())
    }
}

/// What a memory destination received
#[derive(Debug, Default)]
pub struct DestinationLog {
    pub bytes: Vec<u8>,
    pub writes: u64,
    pub closed: bool,
    pub aborted: bool,
}

/// Destination collecting bytes in memory
#[derive(Clone, Default)]
pub struct MemoryDestination {
    log: Arc<Mutex<DestinationLog>>,
    fail_close: bool,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destination whose `close` reports a full disk
    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> Arc<Mutex<DestinationLog>> {
        Arc::clone(&self.log)
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut DestinationLog) -> Result<T, DomainError>) -> Result<T, DomainError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| DomainError::Internal("destination log poisoned".to_string()))?;
        f(&mut *log)
    }
}

#[async_trait]
impl DestinationSink for MemoryDestination {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), DomainError> {
        self.with_log(|log| {
            if log.closed || log.aborted {
                return Err(DomainError::Io("destination is no longer writable".to_string()));
            }
            log.bytes.extend_from_slice(bytes);
            log.writes += 1;
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<(), DomainError> {
        if self.fail_close {
            return Err(DomainError::Io("disk full".to_string()));
        }
        self.with_log(|log| {
            if log.aborted {
                return Err(DomainError::Io("destination was aborted".to_string()));
            }
            log.closed = true;
            Ok(())
        })
    }

    async fn abort(&mut self) -> Result<(), DomainError> {
        self.with_log(|log| {
            log.aborted = true;
            log.bytes.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_sample_counts() {
        let media = SimulatedMedia::default();
        assert_eq!(media.frame_duration_us(), 33_333);
        // 9.9999 s of 48 kHz audio in 1024-sample frames
        assert_eq!(media.audio_frame_count(), 469);
        let samples = media.samples();
        assert_eq!(samples.len(), 300 + 469);
        assert!(samples.windows(2).all(|w| w[0].timestamp_us <= w[1].timestamp_us));
    }

    #[test]
    fn test_swapped_samples_are_out_of_order() {
        let media = SimulatedMedia {
            audio: None,
            frame_count: 4,
            swap_adjacent_samples: true,
            ..SimulatedMedia::default()
        };
        let order: Vec<i64> = media.samples().iter().map(|s| s.timestamp_us).collect();
        assert_eq!(order, vec![33_333, 0, 99_999, 66_666]);
    }

    #[tokio::test]
    async fn test_demux_event_order() {
        let media = SimulatedMedia {
            frame_count: 2,
            audio: None,
            ready_signals: 2,
            ..SimulatedMedia::default()
        };
        let mut demux = SimulatedDemux::new(&media);
        let mut ready = 0;
        let mut samples = 0;
        loop {
            match demux.next_event().await.unwrap() {
                DemuxEvent::Ready(_) => ready += 1,
                DemuxEvent::Sample(_) => samples += 1,
                DemuxEvent::Progress(_) => {}
                DemuxEvent::End => break,
            }
        }
        assert_eq!((ready, samples), (2, 2));
    }

    #[tokio::test]
    async fn test_encoder_rejects_second_configure() {
        let mut codecs = SimulatedCodecs::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut encoder = codecs.create_encoder(TrackKind::Audio, tx).unwrap();
        let config = EncoderConfig::Audio(AudioEncoderConfig {
            codec: DEFAULT_AUDIO_CODEC.to_string(),
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
        });
        encoder.configure(&config).unwrap();
        assert!(matches!(encoder.configure(&config), Err(DomainError::Configuration(_))));
        assert_eq!(encoder.state(), CodecState::Configured);
    }

    #[tokio::test]
    async fn test_encoder_emits_chunks_in_order() {
        let mut codecs = SimulatedCodecs::with_latency(Duration::from_millis(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut encoder = codecs.create_encoder(TrackKind::Audio, tx).unwrap();
        encoder
            .configure(&EncoderConfig::Audio(AudioEncoderConfig {
                codec: DEFAULT_AUDIO_CODEC.to_string(),
                sample_rate: 48_000,
                channels: 2,
                bitrate: 128_000,
            }))
            .unwrap();
        for i in 0..5 {
            let frame = DecodedFrame {
                kind: TrackKind::Audio,
                timestamp_us: i * 21_333,
                duration_us: 21_333,
                audio_layout: None,
                payload: Box::new(()),
            };
            encoder.encode(frame, EncodeOptions::default()).unwrap();
        }
        encoder.flush().await.unwrap();
        assert_eq!(encoder.queue_depth(), 0);
        let mut timestamps = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            timestamps.push(chunk.timestamp_us);
        }
        assert_eq!(timestamps, vec![0, 21_333, 42_666, 63_999, 85_332]);
    }

    #[tokio::test]
    async fn test_memory_mux_rejects_regressing_timestamps() {
        let mut factory = SimulatedMuxFactory::new(TimestampUnit::Microseconds);
        let mut destination = MemoryDestination::new();
        let config = MuxConfig {
            container: Container::Mp4,
            video: MuxVideoTrack {
                codec: MuxCodec::Avc,
                geometry: OutputGeometry::new(640, 360),
                framerate: 30.0,
            },
            audio: None,
        };
        let mut mux = factory.create(&config, &destination).unwrap();
        let chunk = |ts| MuxChunk {
            kind: TrackKind::Video,
            chunk_type: ChunkType::Key,
            timestamp: ts,
            duration: 10,
            data: vec![1, 2, 3],
            decoder_config: None,
        };
        mux.add_video_chunk(chunk(10), &mut destination).await.unwrap();
        let err = mux.add_video_chunk(chunk(5), &mut destination).await.unwrap_err();
        assert!(err.is_timestamp_ordering());
        mux.finalize(&mut destination).await.unwrap();

        let log = destination.log();
        let log = log.lock().unwrap();
        assert!(log.bytes.starts_with(b"TXSIM1"));
        assert_eq!(&log.bytes[log.bytes.len() - 21..log.bytes.len() - 16], b"TXEND");
    }

    #[tokio::test]
    async fn test_flush_completes_after_output_receiver_is_dropped() {
        let media = SimulatedMedia {
            frame_count: 5,
            audio: None,
            ..SimulatedMedia::default()
        };
        let mut codecs = SimulatedCodecs::with_latency(Duration::from_millis(1));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut decoder = codecs.create_decoder(TrackKind::Video, tx).unwrap();
        let format = media.descriptor().video.unwrap();
        decoder.configure(&DecoderConfig::Video(format)).unwrap();
        drop(rx);

        for sample in media.samples() {
            decoder.decode(sample).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), decoder.flush())
            .await
            .expect("flush should not wait on undeliverable frames")
            .unwrap();
        assert_eq!(decoder.queue_depth(), 0);
    }
}
