// FFmpeg codecs - Decode and encode capabilities
//
// Video is scaled to YUV420P at the configured geometry before encoding.
// Audio is resampled to the encoder's sample format and regrouped through a
// sample FIFO, because most audio encoders only accept fixed-size frames.

use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, Flags};
use ffmpeg_next::format::{self, Pixel};
use ffmpeg_next::software::{resampling, scaling};
use ffmpeg_next::util::frame;
use ffmpeg_next::{ffi, picture, ChannelLayout, Dictionary, Packet, Rational};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::{codec_id, codec_threading, rescale, set_extradata, MICROS};
use crate::domain::errors::*;
use crate::domain::model::*;
use crate::ports::*;

/// Fallback frame size for encoders that accept any size
const DEFAULT_AUDIO_FRAME_SIZE: usize = 1024;

fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == ffi::EAGAIN)
}

fn configuration(kind: TrackKind, what: &str, e: impl std::fmt::Display) -> DomainError {
    DomainError::Configuration(format!("{} {}: {}", kind, what, e))
}

fn submission(kind: TrackKind, what: &str, e: impl std::fmt::Display) -> DomainError {
    DomainError::Submission(format!("{} {}: {}", kind, what, e))
}

/// Decoded picture travelling from decoder to encoder
struct VideoPayload(frame::Video);

/// Decoded audio travelling from decoder to encoder
struct AudioPayload(frame::Audio);

// SAFETY: a frame is owned by exactly one payload and never aliased
unsafe impl Send for VideoPayload {}
unsafe impl Send for AudioPayload {}

/// Factory for libav-backed codecs
#[derive(Debug, Default)]
pub struct FfmpegCodecs;

impl FfmpegCodecs {
    pub fn new() -> Self {
        Self
    }
}

impl CodecFactory for FfmpegCodecs {
    fn create_decoder(
        &mut self,
        kind: TrackKind,
        output: UnboundedSender<DecodedFrame>,
    ) -> Result<Box<dyn DecodeCapability>, DomainError> {
        Ok(Box::new(FfmpegDecoder {
            kind,
            output: Some(output),
            decoder: None,
            state: CodecState::Unconfigured,
            frame_duration_us: (1_000_000.0 / DEFAULT_FRAMERATE) as i64,
        }))
    }

    fn create_encoder(
        &mut self,
        kind: TrackKind,
        output: UnboundedSender<EncodedChunk>,
    ) -> Result<Box<dyn EncodeCapability>, DomainError> {
        Ok(Box::new(FfmpegEncoder {
            kind,
            output: Some(output),
            encoder: None,
            state: CodecState::Unconfigured,
            config_sent: false,
        }))
    }
}

enum OpenDecoder {
    Video(ffmpeg::decoder::Video),
    Audio(ffmpeg::decoder::Audio),
}

/// libav decoder
pub struct FfmpegDecoder {
    kind: TrackKind,
    output: Option<UnboundedSender<DecodedFrame>>,
    decoder: Option<OpenDecoder>,
    state: CodecState,
    frame_duration_us: i64,
}

// SAFETY: the codec context is owned by this decoder and used from one task at a time
unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    fn open(&mut self, config: &DecoderConfig) -> Result<OpenDecoder, DomainError> {
        let kind = self.kind;
        let (codec_name, description) = match config {
            DecoderConfig::Video(v) => (&v.codec, v.description.as_deref()),
            DecoderConfig::Audio(a) => (&a.codec, a.description.as_deref()),
        };
        let id = codec_id(codec_name)
            .ok_or_else(|| DomainError::UnsupportedCodec(format!("No decoder for {}", codec_name)))?;

        let mut parameters = codec::Parameters::new();
        // SAFETY: the parameters object was just allocated and is exclusively ours
        unsafe {
            let p = parameters.as_mut_ptr();
            (*p).codec_id = id.into();
            match config {
                DecoderConfig::Video(v) => {
                    (*p).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                    (*p).width = v.width as i32;
                    (*p).height = v.height as i32;
                }
                DecoderConfig::Audio(a) => {
                    (*p).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                    (*p).sample_rate = a.sample_rate as i32;
                    ffi::av_channel_layout_default(&mut (*p).ch_layout, a.channels as i32);
                }
            }
            if let Some(bytes) = description.filter(|d| !d.is_empty()) {
                set_extradata(&mut (*p).extradata, &mut (*p).extradata_size, bytes);
            }
        }

        let mut context = codec::context::Context::from_parameters(parameters)
            .map_err(|e| configuration(kind, "decoder parameters", e))?;
        context.set_threading(codec_threading());
        // SAFETY: configuring an unopened context
        unsafe {
            (*context.as_mut_ptr()).pkt_timebase = MICROS.into();
        }

        let decoder = match config {
            DecoderConfig::Video(v) => {
                if let Some(fps) = v.framerate.filter(|f| *f > 0.0) {
                    self.frame_duration_us = (1_000_000.0 / fps).round() as i64;
                }
                OpenDecoder::Video(context.decoder().video().map_err(|e| configuration(kind, "decoder", e))?)
            }
            DecoderConfig::Audio(_) => {
                OpenDecoder::Audio(context.decoder().audio().map_err(|e| configuration(kind, "decoder", e))?)
            }
        };
        debug!("Opened {} decoder for {}", kind, codec_name);
        Ok(decoder)
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ffmpeg::Error> {
        match &mut self.decoder {
            Some(OpenDecoder::Video(d)) => d.send_packet(packet),
            Some(OpenDecoder::Audio(d)) => d.send_packet(packet),
            None => Ok(()),
        }
    }

    fn send_eof(&mut self) -> Result<(), ffmpeg::Error> {
        match &mut self.decoder {
            Some(OpenDecoder::Video(d)) => d.send_eof(),
            Some(OpenDecoder::Audio(d)) => d.send_eof(),
            None => Ok(()),
        }
    }

    /// Forward every frame the decoder has ready
    fn drain(&mut self) -> Result<(), DomainError> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| DomainError::CapabilityClosed(format!("{} decoder closed", self.kind)))?;
        let closed = || DomainError::CapabilityClosed("decoded frame receiver dropped".to_string());

        match &mut self.decoder {
            Some(OpenDecoder::Video(decoder)) => loop {
                let mut decoded = frame::Video::empty();
                if decoder.receive_frame(&mut decoded).is_err() {
                    break;
                }
                let Some(timestamp_us) = decoded.timestamp().or(decoded.pts()) else {
                    continue;
                };
                output
                    .send(DecodedFrame {
                        kind: TrackKind::Video,
                        timestamp_us,
                        duration_us: self.frame_duration_us,
                        audio_layout: None,
                        payload: Box::new(VideoPayload(decoded)),
                    })
                    .map_err(|_| closed())?;
            },
            Some(OpenDecoder::Audio(decoder)) => loop {
                let mut decoded = frame::Audio::empty();
                if decoder.receive_frame(&mut decoded).is_err() {
                    break;
                }
                let Some(timestamp_us) = decoded.timestamp().or(decoded.pts()) else {
                    continue;
                };
                let sample_rate = decoded.rate();
                let channels = decoded.ch_layout().channels() as u32;
                let duration_us = if sample_rate > 0 {
                    decoded.samples() as i64 * 1_000_000 / sample_rate as i64
                } else {
                    0
                };
                output
                    .send(DecodedFrame {
                        kind: TrackKind::Audio,
                        timestamp_us,
                        duration_us,
                        audio_layout: Some(AudioLayout { sample_rate, channels }),
                        payload: Box::new(AudioPayload(decoded)),
                    })
                    .map_err(|_| closed())?;
            },
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl DecodeCapability for FfmpegDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DomainError> {
        if self.state != CodecState::Unconfigured {
            return Err(DomainError::Configuration(format!("{} decoder already configured", self.kind)));
        }
        match self.open(config) {
            Ok(decoder) => {
                self.decoder = Some(decoder);
                self.state = CodecState::Configured;
                Ok(())
            }
            Err(e) => {
                self.state = CodecState::Closed;
                Err(e)
            }
        }
    }

    fn decode(&mut self, sample: EncodedSample) -> Result<(), DomainError> {
        if self.state != CodecState::Configured {
            return Err(DomainError::CapabilityClosed(format!("{} decoder is not configured", self.kind)));
        }
        let mut packet = Packet::copy(&sample.data);
        packet.set_pts(Some(sample.timestamp_us));
        packet.set_dts(sample.decode_timestamp_us);
        packet.set_duration(sample.duration_us);
        if sample.chunk_type.is_key() {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }

        match self.send(&packet) {
            Ok(()) => {}
            Err(e) if is_again(&e) => {
                // Input queue full: take frames out, then retry once
                self.drain()?;
                self.send(&packet).map_err(|e| submission(self.kind, "decode", e))?;
            }
            Err(e) => return Err(submission(self.kind, "decode", e)),
        }
        self.drain()
    }

    async fn flush(&mut self) -> Result<(), DomainError> {
        if self.state != CodecState::Configured {
            return Ok(());
        }
        self.drain()?;
        match self.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) if is_again(&e) => {
                self.drain()?;
                let _ = self.send_eof();
            }
            Err(e) => return Err(submission(self.kind, "flush", e)),
        }
        self.drain()
    }

    fn state(&self) -> CodecState {
        self.state
    }

    fn queue_depth(&self) -> usize {
        0
    }

    fn close(&mut self) {
        self.decoder = None;
        self.output = None;
        self.state = CodecState::Closed;
    }
}

/// Sample FIFO in the encoder's format
struct SampleFifo {
    fifo: *mut ffi::AVAudioFifo,
}

impl SampleFifo {
    fn new(format: format::Sample, channels: u32) -> Result<Self, DomainError> {
        // SAFETY: plain allocation, checked for null below
        let fifo = unsafe { ffi::av_audio_fifo_alloc(format.into(), channels as i32, 1) };
        if fifo.is_null() {
            return Err(DomainError::Internal("Failed to allocate audio FIFO".to_string()));
        }
        Ok(Self { fifo })
    }

    fn len(&self) -> usize {
        // SAFETY: the FIFO lives as long as self
        unsafe { ffi::av_audio_fifo_size(self.fifo).max(0) as usize }
    }

    fn push(&mut self, source: &frame::Audio) -> Result<(), DomainError> {
        let samples = source.samples() as i32;
        if samples == 0 {
            return Ok(());
        }
        // SAFETY: the frame's planes hold `samples` samples in the FIFO's format
        let written = unsafe {
            ffi::av_audio_fifo_write(
                self.fifo,
                (*source.as_ptr()).extended_data as *const *mut std::ffi::c_void,
                samples,
            )
        };
        if written < samples {
            return Err(DomainError::Internal("Audio FIFO write failed".to_string()));
        }
        Ok(())
    }

    /// Pop up to `samples` samples into a new frame
    fn pop(&mut self, samples: usize, template: &AudioTarget) -> Result<frame::Audio, DomainError> {
        let samples = samples.min(self.len());
        let mut out = template.allocate(samples)?;
        // SAFETY: `out` was allocated for `samples` samples in the FIFO's format
        let read = unsafe {
            ffi::av_audio_fifo_read(
                self.fifo,
                (*out.as_mut_ptr()).extended_data as *const *mut std::ffi::c_void,
                samples as i32,
            )
        };
        if read < samples as i32 {
            return Err(DomainError::Internal("Audio FIFO read failed".to_string()));
        }
        Ok(out)
    }
}

impl Drop for SampleFifo {
    fn drop(&mut self) {
        // SAFETY: allocated in `new`, freed once
        unsafe { ffi::av_audio_fifo_free(self.fifo) }
    }
}

/// Sample layout an audio encoder accepts
#[derive(Debug, Clone, Copy)]
struct AudioTarget {
    format: format::Sample,
    sample_rate: u32,
    channels: u32,
}

impl AudioTarget {
    /// Set format, rate and layout on an empty frame
    unsafe fn describe(&self, target: *mut ffi::AVFrame) {
        (*target).format = ffi::AVSampleFormat::from(self.format) as i32;
        (*target).sample_rate = self.sample_rate as i32;
        ffi::av_channel_layout_default(&mut (*target).ch_layout, self.channels as i32);
    }

    fn allocate(&self, samples: usize) -> Result<frame::Audio, DomainError> {
        let mut out = frame::Audio::empty();
        // SAFETY: `out` is a fresh frame without buffers
        let ret = unsafe {
            let f = out.as_mut_ptr();
            self.describe(f);
            (*f).nb_samples = samples as i32;
            ffi::av_frame_get_buffer(f, 0)
        };
        if ret < 0 {
            return Err(DomainError::Internal(format!("Audio frame allocation failed: {}", ffmpeg::Error::from(ret))));
        }
        Ok(out)
    }
}

/// Converts decoded audio to the encoder's format, rate and layout
struct Resampler {
    context: resampling::Context,
    target: AudioTarget,
}

impl Resampler {
    fn new(source: &frame::Audio, target: AudioTarget) -> Result<Self, DomainError> {
        // Declare the source by channel count; unspecified layouts confuse swr
        let source_layout = ChannelLayout::default_for_channels(source.ch_layout().channels() as u32);
        let context = resampling::Context::get2(
            source.format(),
            source_layout,
            source.rate(),
            target.format,
            ChannelLayout::default_for_channels(target.channels),
            target.sample_rate,
        )
        .map_err(|e| DomainError::Configuration(format!("Audio resampler setup failed: {}", e)))?;
        Ok(Self { context, target })
    }

    fn convert(&mut self, source: &frame::Audio) -> Result<frame::Audio, DomainError> {
        let mut out = frame::Audio::empty();
        self.context
            .run(source, &mut out)
            .map_err(|e| DomainError::Submission(format!("Audio resampling failed: {}", e)))?;
        Ok(out)
    }

    /// Samples still held back by rate conversion
    fn flush(&mut self) -> Result<Option<frame::Audio>, DomainError> {
        let pending = self.context.delay().map_or(0, |d| d.output.max(0) as usize);
        if pending == 0 {
            return Ok(None);
        }
        let mut out = self.target.allocate(pending)?;
        self.context
            .flush(&mut out)
            .map_err(|e| DomainError::Submission(format!("Audio resampler flush failed: {}", e)))?;
        Ok(Some(out).filter(|f| f.samples() > 0))
    }
}

struct VideoEncoder {
    encoder: ffmpeg::encoder::Video,
    geometry: OutputGeometry,
    scaler: Option<scaling::Context>,
    frame_duration_us: i64,
}

struct AudioEncoder {
    encoder: ffmpeg::encoder::Audio,
    target: AudioTarget,
    frame_size: usize,
    resampler: Option<Resampler>,
    fifo: SampleFifo,
    /// Next frame's timestamp in samples
    next_pts: Option<i64>,
    time_base: Rational,
}

enum OpenEncoder {
    Video(VideoEncoder),
    Audio(AudioEncoder),
}

/// libav encoder
pub struct FfmpegEncoder {
    kind: TrackKind,
    output: Option<UnboundedSender<EncodedChunk>>,
    encoder: Option<OpenEncoder>,
    state: CodecState,
    config_sent: bool,
}

// SAFETY: codec, scaler, resampler and FIFO are owned by this encoder and
// used from one task at a time
unsafe impl Send for FfmpegEncoder {}

/// Encoder options for the requested rate control
fn rate_control_options(id: codec::Id, rate_control: RateControl, encoder: &mut ffmpeg::encoder::video::Video) -> Dictionary<'static> {
    let mut options = Dictionary::new();
    match rate_control {
        RateControl::Variable(bps) => encoder.set_bit_rate(bps as usize),
        RateControl::Constant(bps) => {
            encoder.set_bit_rate(bps as usize);
            encoder.set_max_bit_rate(bps as usize);
            if id == codec::Id::H264 {
                options.set("nal-hrd", "cbr");
            }
        }
        RateControl::Quantizer(q) => match id {
            codec::Id::H264 | codec::Id::HEVC => options.set("qp", &q.to_string()),
            _ => {
                encoder.set_bit_rate(0);
                options.set("crf", &q.to_string());
            }
        },
    }
    options
}

/// x264 profile and level from an `avc1.PPCCLL` string
fn h264_profile_level(codec: &str) -> Option<(&'static str, String)> {
    let hex = codec.split('.').nth(1).filter(|h| h.len() == 6)?;
    let profile = match u8::from_str_radix(&hex[0..2], 16).ok()? {
        0x42 => "baseline",
        0x4d => "main",
        0x64 => "high",
        _ => return None,
    };
    let level = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((profile, format!("{}.{}", level / 10, level % 10)))
}

impl FfmpegEncoder {
    fn open_video(&self, config: &VideoEncoderConfig) -> Result<VideoEncoder, DomainError> {
        let kind = self.kind;
        let id = codec_id(&config.codec)
            .ok_or_else(|| DomainError::UnsupportedCodec(format!("No encoder for {}", config.codec)))?;
        let codec = ffmpeg::encoder::find(id)
            .ok_or_else(|| DomainError::UnsupportedCodec(format!("{:?} encoder not available", id)))?;

        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| configuration(kind, "encoder context", e))?;
        encoder.set_width(config.geometry.width);
        encoder.set_height(config.geometry.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(MICROS);
        encoder.set_frame_rate(Some(Rational::from(config.framerate)));
        encoder.set_gop(config.gop_size);
        // The mux requires presentation order to match decode order
        encoder.set_max_b_frames(0);
        encoder.set_flags(Flags::GLOBAL_HEADER);
        encoder.set_threading(codec_threading());

        let mut options = rate_control_options(id, config.rate_control, &mut encoder);
        if id == codec::Id::H264 {
            if let Some((profile, level)) = h264_profile_level(&config.codec) {
                options.set("profile", profile);
                options.set("level", &level);
            }
        }

        let encoder = encoder
            .open_as_with(codec, options)
            .map_err(|e| configuration(kind, "encoder", e))?;
        debug!("Opened video encoder {} at {}", config.codec, config.geometry);

        Ok(VideoEncoder {
            encoder,
            geometry: config.geometry,
            scaler: None,
            frame_duration_us: (1_000_000.0 / config.framerate).round() as i64,
        })
    }

    fn open_audio(&self, config: &AudioEncoderConfig) -> Result<AudioEncoder, DomainError> {
        let kind = self.kind;
        let id = codec_id(&config.codec)
            .ok_or_else(|| DomainError::UnsupportedCodec(format!("No encoder for {}", config.codec)))?;
        let codec = ffmpeg::encoder::find(id)
            .ok_or_else(|| DomainError::UnsupportedCodec(format!("{:?} encoder not available", id)))?;
        let sample_format = codec
            .audio()
            .ok()
            .and_then(|audio| audio.formats())
            .and_then(|mut formats| formats.next())
            .unwrap_or(format::Sample::F32(format::sample::Type::Planar));
        let time_base = Rational(1, config.sample_rate as i32);

        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(|e| configuration(kind, "encoder context", e))?;
        encoder.set_rate(config.sample_rate as i32);
        encoder.set_format(sample_format);
        encoder.set_bit_rate(config.bitrate as usize);
        encoder.set_time_base(time_base);
        encoder.set_flags(Flags::GLOBAL_HEADER);
        encoder.set_ch_layout(ChannelLayout::default_for_channels(config.channels));
        let encoder = encoder
            .open_as(codec)
            .map_err(|e| configuration(kind, "encoder", e))?;

        let frame_size = match encoder.frame_size() as usize {
            0 => DEFAULT_AUDIO_FRAME_SIZE,
            n => n,
        };
        debug!(
            "Opened audio encoder {} at {} Hz, {} channels, frame size {}",
            config.codec, config.sample_rate, config.channels, frame_size
        );
        let target = AudioTarget {
            format: sample_format,
            sample_rate: config.sample_rate,
            channels: config.channels,
        };
        Ok(AudioEncoder {
            encoder,
            target,
            frame_size,
            resampler: None,
            fifo: SampleFifo::new(sample_format, config.channels)?,
            next_pts: None,
            time_base,
        })
    }

    fn decoder_config(&self) -> Option<Vec<u8>> {
        let ctx = match &self.encoder {
            Some(OpenEncoder::Video(v)) => unsafe { v.encoder.as_ptr() },
            Some(OpenEncoder::Audio(a)) => unsafe { a.encoder.as_ptr() },
            None => return None,
        };
        // SAFETY: the opened encoder owns its extradata
        unsafe {
            ((*ctx).extradata_size > 0 && !(*ctx).extradata.is_null())
                .then(|| std::slice::from_raw_parts((*ctx).extradata, (*ctx).extradata_size as usize).to_vec())
        }
    }

    /// Forward every packet the encoder has ready
    fn drain(&mut self) -> Result<(), DomainError> {
        let mut decoder_config = if self.config_sent { None } else { self.decoder_config() };
        let kind = self.kind;
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| DomainError::CapabilityClosed(format!("{} encoder closed", kind)))?;

        loop {
            let mut packet = Packet::empty();
            let (received, time_base, default_duration) = match &mut self.encoder {
                Some(OpenEncoder::Video(v)) => (v.encoder.receive_packet(&mut packet), MICROS, v.frame_duration_us),
                Some(OpenEncoder::Audio(a)) => (a.encoder.receive_packet(&mut packet), a.time_base, 0),
                None => return Ok(()),
            };
            if received.is_err() {
                return Ok(());
            }
            let Some(pts) = packet.pts().or(packet.dts()) else {
                warn!("{} encoder produced a packet without timestamp", kind);
                continue;
            };
            let duration_us = match packet.duration() {
                d if d > 0 => rescale(d, time_base, MICROS),
                _ => default_duration,
            };
            output
                .send(EncodedChunk {
                    kind,
                    chunk_type: if packet.is_key() { ChunkType::Key } else { ChunkType::Delta },
                    timestamp_us: rescale(pts, time_base, MICROS),
                    duration_us,
                    data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                    decoder_config: decoder_config.take(),
                })
                .map_err(|_| DomainError::CapabilityClosed("encoded chunk receiver dropped".to_string()))?;
            self.config_sent = true;
        }
    }

    fn encode_video(&mut self, decoded: frame::Video, timestamp_us: i64, key_frame: bool) -> Result<(), DomainError> {
        let kind = self.kind;
        let Some(OpenEncoder::Video(video)) = &mut self.encoder else {
            return Err(DomainError::CapabilityClosed(format!("{} encoder is not configured", kind)));
        };

        if video.scaler.is_none() {
            let scaler = scaling::Context::get(
                decoded.format(),
                decoded.width(),
                decoded.height(),
                Pixel::YUV420P,
                video.geometry.width,
                video.geometry.height,
                scaling::Flags::BILINEAR,
            )
            .map_err(|e| submission(kind, "scaler", e))?;
            video.scaler = Some(scaler);
        }
        let mut scaled = frame::Video::empty();
        if let Some(scaler) = video.scaler.as_mut() {
            scaler.run(&decoded, &mut scaled).map_err(|e| submission(kind, "scale", e))?;
        }
        scaled.set_pts(Some(timestamp_us));
        scaled.set_kind(if key_frame { picture::Type::I } else { picture::Type::None });

        match video.encoder.send_frame(&scaled) {
            Ok(()) => {}
            Err(e) if is_again(&e) => {
                self.drain()?;
                if let Some(OpenEncoder::Video(video)) = &mut self.encoder {
                    video.encoder.send_frame(&scaled).map_err(|e| submission(kind, "encode", e))?;
                }
            }
            Err(e) => return Err(submission(kind, "encode", e)),
        }
        self.drain()
    }

    /// Send full frames from the FIFO; with `finish`, also the remainder
    fn encode_buffered_audio(&mut self, finish: bool) -> Result<(), DomainError> {
        let kind = self.kind;
        loop {
            let Some(OpenEncoder::Audio(audio)) = &mut self.encoder else {
                return Ok(());
            };
            let available = audio.fifo.len();
            if available == 0 || (available < audio.frame_size && !finish) {
                return Ok(());
            }
            let mut chunk = audio.fifo.pop(audio.frame_size, &audio.target)?;
            let pts = audio.next_pts.unwrap_or(0);
            chunk.set_pts(Some(pts));
            audio.next_pts = Some(pts + chunk.samples() as i64);
            audio.encoder.send_frame(&chunk).map_err(|e| submission(kind, "encode", e))?;
            self.drain()?;
        }
    }

    fn encode_audio(&mut self, decoded: frame::Audio, timestamp_us: i64) -> Result<(), DomainError> {
        let kind = self.kind;
        let Some(OpenEncoder::Audio(audio)) = &mut self.encoder else {
            return Err(DomainError::CapabilityClosed(format!("{} encoder is not configured", kind)));
        };
        if audio.next_pts.is_none() {
            audio.next_pts = Some(rescale(timestamp_us, MICROS, audio.time_base));
        }
        if audio.resampler.is_none() {
            audio.resampler = Some(Resampler::new(&decoded, audio.target)?);
        }
        if let Some(resampler) = audio.resampler.as_mut() {
            let converted = resampler.convert(&decoded)?;
            audio.fifo.push(&converted)?;
        }
        self.encode_buffered_audio(false)
    }
}

#[async_trait]
impl EncodeCapability for FfmpegEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), DomainError> {
        if self.state != CodecState::Unconfigured {
            return Err(DomainError::Configuration(format!("{} encoder already configured", self.kind)));
        }
        let opened = match config {
            EncoderConfig::Video(v) => self.open_video(v).map(OpenEncoder::Video),
            EncoderConfig::Audio(a) => self.open_audio(a).map(OpenEncoder::Audio),
        };
        match opened {
            Ok(encoder) => {
                self.encoder = Some(encoder);
                self.state = CodecState::Configured;
                Ok(())
            }
            Err(e) => {
                self.state = CodecState::Closed;
                Err(e)
            }
        }
    }

    fn encode(&mut self, frame: DecodedFrame, options: EncodeOptions) -> Result<(), DomainError> {
        if self.state != CodecState::Configured {
            return Err(DomainError::CapabilityClosed(format!("{} encoder is not configured", self.kind)));
        }
        let DecodedFrame { timestamp_us, payload, .. } = frame;
        if let Some(OpenEncoder::Video(_)) = &self.encoder {
            let picture = payload
                .downcast::<VideoPayload>()
                .map_err(|_| DomainError::Submission("Frame was not produced by an FFmpeg video decoder".to_string()))?;
            return self.encode_video(picture.0, timestamp_us, options.key_frame);
        }
        let samples = payload
            .downcast::<AudioPayload>()
            .map_err(|_| DomainError::Submission("Frame was not produced by an FFmpeg audio decoder".to_string()))?;
        self.encode_audio(samples.0, timestamp_us)
    }

    async fn flush(&mut self) -> Result<(), DomainError> {
        if self.state != CodecState::Configured {
            return Ok(());
        }
        let kind = self.kind;
        if let Some(OpenEncoder::Audio(audio)) = &mut self.encoder {
            if let Some(tail) = audio.resampler.as_mut().map(Resampler::flush).transpose()?.flatten() {
                audio.fifo.push(&tail)?;
            }
        }
        self.encode_buffered_audio(true)?;

        let eof = match &mut self.encoder {
            Some(OpenEncoder::Video(v)) => v.encoder.send_eof(),
            Some(OpenEncoder::Audio(a)) => a.encoder.send_eof(),
            None => Ok(()),
        };
        match eof {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) => return Err(submission(kind, "flush", e)),
        }
        self.drain()
    }

    fn state(&self) -> CodecState {
        self.state
    }

    fn queue_depth(&self) -> usize {
        0
    }

    fn close(&mut self) {
        self.encoder = None;
        self.output = None;
        self.state = CodecState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_profile_level() {
        assert_eq!(h264_profile_level("avc1.640028"), Some(("high", "4.0".to_string())));
        assert_eq!(h264_profile_level("avc1.4d001f"), Some(("main", "3.1".to_string())));
        assert_eq!(h264_profile_level("avc1.42001e"), Some(("baseline", "3.0".to_string())));
        assert_eq!(h264_profile_level("avc1"), None);
    }

    #[test]
    fn test_resampler_converts_rate_and_layout() {
        let planar_float = format::Sample::F32(format::sample::Type::Planar);
        let source = AudioTarget {
            format: planar_float,
            sample_rate: 44_100,
            channels: 2,
        };
        let target = AudioTarget {
            format: planar_float,
            sample_rate: 48_000,
            channels: 1,
        };
        let input = source.allocate(1024).unwrap();

        let mut resampler = Resampler::new(&input, target).unwrap();
        let converted = resampler.convert(&input).unwrap();
        assert_eq!(converted.rate(), 48_000);
        assert_eq!(converted.ch_layout().channels(), 1);

        // 1024 samples at 44.1 kHz are about 1115 at 48 kHz once the tail is flushed
        let tail = resampler.flush().unwrap().map_or(0, |f| f.samples());
        let produced = converted.samples() + tail;
        assert!((1050..=1180).contains(&produced), "produced {} samples", produced);
    }
}
