// FFmpeg demux source - Reads compressed samples from a container file

use std::path::Path;

use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::context::Input;
use ffmpeg_next::media::Type;
use ffmpeg_next::{Rational, Stream};
use tracing::{debug, info};

use super::{codec_string, open_error, rescale, MICROS};
use crate::domain::errors::*;
use crate::domain::model::*;
use crate::ports::{DemuxEvent, DemuxSource};

/// Selected elementary stream
#[derive(Debug, Clone, Copy)]
struct TrackRef {
    index: usize,
    time_base: Rational,
}

/// Demux source reading a local media file
pub struct FfmpegDemux {
    input: Input,
    video: Option<TrackRef>,
    audio: Option<TrackRef>,
    descriptor: SourceDescriptor,
    ready_sent: bool,
    finished: bool,
}

impl FfmpegDemux {
    pub fn open(path: &Path) -> Result<Self, DomainError> {
        let input = ffmpeg::format::input(&path).map_err(|e| open_error(path, e))?;

        let video_stream = input
            .streams()
            .best(Type::Video)
            .ok_or_else(|| DomainError::InvalidFormat(format!("{}: no video stream", path.display())))?;
        let video = TrackRef {
            index: video_stream.index(),
            time_base: video_stream.time_base(),
        };
        let video_format = video_format(&video_stream)?;
        let total_frame_count = u64::try_from(video_stream.frames()).ok().filter(|n| *n > 0);

        let (audio, audio_format) = match input.streams().best(Type::Audio) {
            Some(stream) => match audio_format(&stream) {
                Some(format) => (
                    Some(TrackRef {
                        index: stream.index(),
                        time_base: stream.time_base(),
                    }),
                    Some(format),
                ),
                None => (None, None),
            },
            None => (None, None),
        };

        let duration_us = (input.duration() > 0).then(|| input.duration());
        info!(
            "Opened {}: {} {}x{}{}",
            path.display(),
            video_format.codec,
            video_format.width,
            video_format.height,
            audio_format
                .as_ref()
                .map(|a| format!(", {} {} Hz", a.codec, a.sample_rate))
                .unwrap_or_default()
        );

        Ok(Self {
            descriptor: SourceDescriptor {
                video: Some(video_format),
                audio: audio_format,
                total_frame_count,
                duration_us,
            },
            input,
            video: Some(video),
            audio,
            ready_sent: false,
            finished: false,
        })
    }

    fn track_for(&self, index: usize) -> Option<(TrackKind, TrackRef)> {
        match (self.video, self.audio) {
            (Some(v), _) if v.index == index => Some((TrackKind::Video, v)),
            (_, Some(a)) if a.index == index => Some((TrackKind::Audio, a)),
            _ => None,
        }
    }
}

fn extradata(stream: &Stream) -> Option<Vec<u8>> {
    // SAFETY: reading from the stream's codec parameters, owned by the input context
    unsafe {
        let ptr = stream.parameters().as_ptr();
        if (*ptr).extradata_size > 0 && !(*ptr).extradata.is_null() {
            Some(std::slice::from_raw_parts((*ptr).extradata, (*ptr).extradata_size as usize).to_vec())
        } else {
            None
        }
    }
}

fn bit_rate(stream: &Stream) -> Option<u64> {
    // SAFETY: as above
    let rate = unsafe { (*stream.parameters().as_ptr()).bit_rate };
    u64::try_from(rate).ok().filter(|r| *r > 0)
}

fn video_format(stream: &Stream) -> Result<VideoFormat, DomainError> {
    let description = extradata(stream);
    // SAFETY: as above
    let (width, height) = unsafe {
        let ptr = stream.parameters().as_ptr();
        ((*ptr).width, (*ptr).height)
    };
    if width <= 0 || height <= 0 {
        return Err(DomainError::InvalidFormat("Video stream has no dimensions".to_string()));
    }
    let rate = if stream.avg_frame_rate().numerator() != 0 {
        stream.avg_frame_rate()
    } else {
        stream.rate()
    };
    let framerate = (rate.numerator() > 0 && rate.denominator() > 0).then(|| f64::from(rate));
    Ok(VideoFormat {
        codec: codec_string(stream.parameters().id(), description.as_deref()),
        width: width as u32,
        height: height as u32,
        framerate,
        bitrate: bit_rate(stream),
        description,
    })
}

fn audio_format(stream: &Stream) -> Option<AudioFormat> {
    let description = extradata(stream);
    // SAFETY: as above
    let (sample_rate, channels) = unsafe {
        let ptr = stream.parameters().as_ptr();
        ((*ptr).sample_rate, (*ptr).ch_layout.nb_channels)
    };
    if sample_rate <= 0 || channels <= 0 {
        debug!("Ignoring audio stream without sample rate or channels");
        return None;
    }
    Some(AudioFormat {
        codec: codec_string(stream.parameters().id(), description.as_deref()),
        sample_rate: sample_rate as u32,
        channels: channels as u32,
        bitrate: bit_rate(stream),
        description,
    })
}

#[async_trait]
impl DemuxSource for FfmpegDemux {
    async fn next_event(&mut self) -> Result<DemuxEvent, DomainError> {
        if !self.ready_sent {
            self.ready_sent = true;
            return Ok(DemuxEvent::Ready(self.descriptor.clone()));
        }
        if self.finished {
            return Ok(DemuxEvent::End);
        }

        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    self.finished = true;
                    return Ok(DemuxEvent::End);
                }
                Err(e) => return Err(DomainError::Io(format!("Failed to read packet: {}", e))),
            }

            let Some((kind, track)) = self.track_for(packet.stream()) else {
                continue;
            };
            let Some(pts) = packet.pts().or(packet.dts()) else {
                debug!("Skipping {} packet without timestamp", kind);
                continue;
            };
            let timestamp_us = rescale(pts, track.time_base, MICROS);

            return Ok(DemuxEvent::Sample(EncodedSample {
                kind,
                chunk_type: if packet.is_key() { ChunkType::Key } else { ChunkType::Delta },
                timestamp_us,
                decode_timestamp_us: packet.dts().map(|dts| rescale(dts, track.time_base, MICROS)),
                duration_us: rescale(packet.duration(), track.time_base, MICROS).max(0),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            }));
        }
    }
}
