// FFmpeg mux sink - Writes MP4/WebM through libavformat
//
// libavformat writes the staging file of the destination directly. The
// container header needs each track's decoder configuration, so chunks are
// held back until every declared track has produced its first chunk.

use std::path::Path;
use std::ptr;

use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::Id;
use ffmpeg_next::format::context::Output;
use ffmpeg_next::{ffi, Packet, Rational};
use tracing::{debug, info, warn};

use super::{rescale, set_extradata, MICROS};
use crate::domain::errors::*;
use crate::domain::model::*;
use crate::ports::{DestinationSink, MuxSink, MuxSinkFactory};

/// Chunks held back before the header is forced out
const MAX_PENDING_CHUNKS: usize = 512;

fn mux_error(what: &str, e: ffmpeg::Error) -> DomainError {
    DomainError::Io(format!("Mux {} failed: {}", what, e))
}

fn codec_id(codec: MuxCodec) -> Id {
    match codec {
        MuxCodec::Avc => Id::H264,
        MuxCodec::Hevc => Id::HEVC,
        MuxCodec::Vp9 => Id::VP9,
        MuxCodec::Vp8 => Id::VP8,
        MuxCodec::Av1 => Id::AV1,
        MuxCodec::Aac => Id::AAC,
        MuxCodec::Opus => Id::OPUS,
    }
}

/// Factory for libavformat mux sinks
#[derive(Debug, Default)]
pub struct FfmpegMuxFactory;

impl FfmpegMuxFactory {
    pub fn new() -> Self {
        Self
    }
}

impl MuxSinkFactory for FfmpegMuxFactory {
    fn create(
        &mut self,
        config: &MuxConfig,
        destination: &dyn DestinationSink,
    ) -> Result<Box<dyn MuxSink>, DomainError> {
        let path = destination.staging_path().ok_or_else(|| {
            DomainError::Configuration("FFmpeg mux requires a file-backed destination".to_string())
        })?;
        Ok(Box::new(FfmpegMux::open(path, config)?))
    }
}

#[derive(Debug)]
struct MuxTrack {
    index: usize,
    time_base: Rational,
    primed: bool,
    last_timestamp: Option<i64>,
}

/// Mux sink backed by a libavformat output context
pub struct FfmpegMux {
    output: Output,
    video: MuxTrack,
    audio: Option<MuxTrack>,
    pending: Vec<MuxChunk>,
    header_written: bool,
    finalized: bool,
}

// SAFETY: the output context is owned by this sink and used from one task at a time
unsafe impl Send for FfmpegMux {}

/// Append a stream and describe it through its codec parameters
///
/// # Safety
/// `output` must be a live output context whose header is not yet written.
unsafe fn new_stream(
    output: &mut Output,
    codec: MuxCodec,
    time_base: Rational,
    describe: impl FnOnce(*mut ffi::AVCodecParameters),
) -> Result<MuxTrack, DomainError> {
    let stream = ffi::avformat_new_stream(output.as_mut_ptr(), ptr::null());
    if stream.is_null() {
        return Err(DomainError::Internal("Failed to allocate output stream".to_string()));
    }
    (*stream).time_base = time_base.into();
    let par = (*stream).codecpar;
    (*par).codec_id = codec_id(codec).into();
    describe(par);
    Ok(MuxTrack {
        index: (*stream).index as usize,
        time_base,
        primed: false,
        last_timestamp: None,
    })
}

impl FfmpegMux {
    pub fn open(path: &Path, config: &MuxConfig) -> Result<Self, DomainError> {
        let format_name = match config.container {
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
        };
        let mut output = ffmpeg::format::output_as(&path, format_name)
            .map_err(|e| DomainError::Io(format!("Failed to open {}: {}", path.display(), e)))?;

        let track = &config.video;
        // SAFETY: fresh output context
        let video = unsafe {
            new_stream(&mut output, track.codec, MICROS, |par| {
                (*par).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                (*par).width = track.geometry.width as i32;
                (*par).height = track.geometry.height as i32;
            })?
        };
        let audio = match &config.audio {
            Some(track) => Some(unsafe {
                // SAFETY: as above
                new_stream(&mut output, track.codec, Rational(1, track.sample_rate as i32), |par| {
                    (*par).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                    (*par).sample_rate = track.sample_rate as i32;
                    ffi::av_channel_layout_default(&mut (*par).ch_layout, track.channels as i32);
                })?
            }),
            None => None,
        };
        debug!(
            "Opened {} mux with {} track(s) at {}",
            format_name,
            1 + audio.is_some() as usize,
            path.display()
        );

        Ok(Self {
            output,
            video,
            audio,
            pending: Vec::new(),
            header_written: false,
            finalized: false,
        })
    }

    fn track_mut(&mut self, kind: TrackKind) -> Result<&mut MuxTrack, DomainError> {
        match kind {
            TrackKind::Video => Ok(&mut self.video),
            TrackKind::Audio => self
                .audio
                .as_mut()
                .ok_or_else(|| DomainError::Configuration("Mux has no audio track".to_string())),
        }
    }

    fn stream_parameters(&mut self, index: usize) -> *mut ffi::AVCodecParameters {
        // SAFETY: `index` was returned by avformat_new_stream on this context
        unsafe { (**(*self.output.as_mut_ptr()).streams.add(index)).codecpar }
    }

    fn ready_for_header(&self) -> bool {
        self.video.primed && self.audio.as_ref().map_or(true, |a| a.primed)
    }

    fn write_header(&mut self) -> Result<(), DomainError> {
        self.output.write_header().map_err(|e| mux_error("header", e))?;
        self.header_written = true;
        // The muxer may pick its own time bases
        let mut tracks = vec![&mut self.video];
        tracks.extend(self.audio.as_mut());
        for track in tracks {
            if let Some(stream) = self.output.stream(track.index) {
                track.time_base = stream.time_base();
            }
        }
        debug!("Wrote container header");

        for chunk in std::mem::take(&mut self.pending) {
            self.write_chunk(chunk)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, chunk: MuxChunk) -> Result<(), DomainError> {
        let track = self.track_mut(chunk.kind)?;
        let (index, time_base) = (track.index, track.time_base);
        let timestamp = rescale(chunk.timestamp, MICROS, time_base);

        let mut packet = Packet::copy(&chunk.data);
        packet.set_stream(index);
        packet.set_pts(Some(timestamp));
        packet.set_dts(Some(timestamp));
        packet.set_duration(rescale(chunk.duration, MICROS, time_base));
        if chunk.chunk_type.is_key() {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        packet
            .write_interleaved(&mut self.output)
            .map_err(|e| mux_error("write", e))
    }

    fn add_chunk(&mut self, chunk: MuxChunk) -> Result<(), DomainError> {
        if self.finalized {
            return Err(DomainError::CapabilityClosed("Mux already finalized".to_string()));
        }
        let header_written = self.header_written;
        let track = self.track_mut(chunk.kind)?;
        if let Some(last) = track.last_timestamp {
            if chunk.timestamp < last {
                return Err(DomainError::TimestampOrdering(format!(
                    "{} chunk at {} after {}",
                    chunk.kind, chunk.timestamp, last
                )));
            }
        }
        track.last_timestamp = Some(chunk.timestamp);

        if header_written {
            return self.write_chunk(chunk);
        }

        let track = self.track_mut(chunk.kind)?;
        if !track.primed {
            track.primed = true;
            let index = track.index;
            if let Some(config) = chunk.decoder_config.as_deref().filter(|c| !c.is_empty()) {
                let par = self.stream_parameters(index);
                // SAFETY: header not written yet, so the parameters are still ours to fill
                unsafe { set_extradata(&mut (*par).extradata, &mut (*par).extradata_size, config) };
            }
        }
        self.pending.push(chunk);

        if self.ready_for_header() {
            self.write_header()
        } else if self.pending.len() >= MAX_PENDING_CHUNKS {
            warn!("Writing container header before every track produced output");
            self.write_header()
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MuxSink for FfmpegMux {
    fn timestamp_unit(&self) -> TimestampUnit {
        TimestampUnit::Microseconds
    }

    async fn add_video_chunk(
        &mut self,
        chunk: MuxChunk,
        _destination: &mut dyn DestinationSink,
    ) -> Result<(), DomainError> {
        self.add_chunk(chunk)
    }

    async fn add_audio_chunk(
        &mut self,
        chunk: MuxChunk,
        _destination: &mut dyn DestinationSink,
    ) -> Result<(), DomainError> {
        self.add_chunk(chunk)
    }

    async fn finalize(&mut self, _destination: &mut dyn DestinationSink) -> Result<(), DomainError> {
        if self.finalized {
            return Ok(());
        }
        if !self.header_written {
            self.write_header()?;
        }
        self.output.write_trailer().map_err(|e| mux_error("trailer", e))?;
        self.finalized = true;
        info!("Finalized container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_ids() {
        assert_eq!(codec_id(MuxCodec::Avc), Id::H264);
        assert_eq!(codec_id(MuxCodec::Opus), Id::OPUS);
        assert_eq!(codec_id(MuxCodec::Vp9), Id::VP9);
    }

    #[test]
    fn test_requires_file_backed_destination() {
        let config = MuxConfig {
            container: Container::Mp4,
            video: MuxVideoTrack {
                codec: MuxCodec::Avc,
                geometry: OutputGeometry::new(640, 360),
                framerate: 30.0,
            },
            audio: None,
        };
        let destination = crate::adapters::MemoryDestination::new();
        assert!(matches!(
            FfmpegMuxFactory::new().create(&config, &destination),
            Err(DomainError::Configuration(_))
        ));
    }
}
