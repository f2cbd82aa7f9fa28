// FFmpeg adapter - Demux, codec and mux capabilities backed by libav
//
// All timestamps cross this boundary in microseconds. Codec work happens
// synchronously inside `decode`/`encode`/`flush`; output is pushed into the
// controller's channels as soon as libav produces it.

mod codec;
mod demux;
mod mux;

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{threading, Id};
use ffmpeg_next::Rational;
use tracing::debug;

use crate::domain::errors::DomainError;

pub use codec::FfmpegCodecs;
pub use demux::FfmpegDemux;
pub use mux::FfmpegMuxFactory;

/// Time base used for every timestamp exchanged with the pipeline
pub(crate) const MICROS: Rational = Rational(1, 1_000_000);

/// Upper bound on codec threads
const MAX_CODEC_THREADS: usize = 16;

/// Initialize libav once per process
pub fn init() -> Result<(), DomainError> {
    ffmpeg::init().map_err(|e| DomainError::Internal(format!("FFmpeg initialization failed: {}", e)))?;
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    Ok(())
}

/// Container duration in seconds, when the input declares one
pub fn probe_duration(path: &Path) -> Result<Option<f64>, DomainError> {
    let input = ffmpeg::format::input(&path).map_err(|e| open_error(path, e))?;
    let duration = input.duration();
    debug!("Probed {}: duration {} us", path.display(), duration);
    Ok((duration > 0).then(|| duration as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)))
}

pub(crate) fn open_error(path: &Path, e: ffmpeg::Error) -> DomainError {
    match e {
        ffmpeg::Error::InvalidData => {
            DomainError::InvalidFormat(format!("{}: unrecognized container", path.display()))
        }
        other => DomainError::Io(format!("Failed to open {}: {}", path.display(), other)),
    }
}

pub(crate) fn codec_threading() -> threading::Config {
    threading::Config {
        kind: threading::Type::Frame,
        count: num_cpus::get().clamp(1, MAX_CODEC_THREADS),
        ..Default::default()
    }
}

/// Map a codec string (`avc1.640028`, `vp09.00.31.08`, `mp4a.40.2`, `opus`)
/// to a libav codec id
pub(crate) fn codec_id(codec: &str) -> Option<Id> {
    let codec = codec.to_ascii_lowercase();
    let family = codec.split('.').next().unwrap_or_default();
    let id = match family {
        "avc1" | "avc3" | "h264" => Id::H264,
        "hvc1" | "hev1" | "hevc" | "h265" => Id::HEVC,
        "vp09" | "vp9" => Id::VP9,
        "vp8" => Id::VP8,
        "av01" | "av1" => Id::AV1,
        "mp4a" | "aac" => Id::AAC,
        "opus" => Id::OPUS,
        "mp3" => Id::MP3,
        "flac" => Id::FLAC,
        _ => return None,
    };
    Some(id)
}

/// Codec string for a demuxed stream. H.264 strings carry the profile and
/// level from the avcC record when it is available.
pub(crate) fn codec_string(id: Id, extradata: Option<&[u8]>) -> String {
    match id {
        Id::H264 => match extradata {
            Some(avcc) if avcc.len() >= 4 && avcc[0] == 1 => {
                format!("avc1.{:02x}{:02x}{:02x}", avcc[1], avcc[2], avcc[3])
            }
            _ => "avc1.640028".to_string(),
        },
        Id::HEVC => "hvc1.1.6.L93.B0".to_string(),
        Id::VP9 => "vp09.00.31.08".to_string(),
        Id::VP8 => "vp8".to_string(),
        Id::AV1 => "av01.0.08M.08".to_string(),
        Id::AAC => "mp4a.40.2".to_string(),
        Id::OPUS => "opus".to_string(),
        Id::MP3 => "mp3".to_string(),
        Id::FLAC => "flac".to_string(),
        other => format!("{:?}", other).to_ascii_lowercase(),
    }
}

/// Copy `bytes` into freshly allocated, padded libav memory
///
/// # Safety
/// `data` and `size` must point at the extradata fields of a live codec
/// context or parameters object that does not yet own extradata.
pub(crate) unsafe fn set_extradata(data: *mut *mut u8, size: *mut i32, bytes: &[u8]) {
    let buffer = ffmpeg::ffi::av_mallocz(bytes.len() + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
    if !buffer.is_null() {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, bytes.len());
        *data = buffer;
        *size = bytes.len() as i32;
    }
}

/// Rescale between time bases without overflow, rounding down
pub(crate) fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if from == to {
        return value;
    }
    let num = value as i128 * from.numerator() as i128 * to.denominator() as i128;
    let den = from.denominator() as i128 * to.numerator() as i128;
    if den == 0 {
        return value;
    }
    num.div_euclid(den) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_id_mapping() {
        assert_eq!(codec_id("avc1.640028"), Some(Id::H264));
        assert_eq!(codec_id("vp09.00.31.08"), Some(Id::VP9));
        assert_eq!(codec_id("mp4a.40.2"), Some(Id::AAC));
        assert_eq!(codec_id("opus"), Some(Id::OPUS));
        assert_eq!(codec_id("theora"), None);
    }

    #[test]
    fn test_codec_string_from_avcc() {
        let avcc = [1u8, 0x4d, 0x00, 0x1f, 0xff];
        assert_eq!(codec_string(Id::H264, Some(&avcc)), "avc1.4d001f");
        assert_eq!(codec_string(Id::H264, None), "avc1.640028");
    }

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(1_000_000, MICROS, Rational(1, 90_000)), 90_000);
        assert_eq!(rescale(3_003, Rational(1, 30_000), MICROS), 100_100);
        assert_eq!(rescale(-1, Rational(1, 1_000), MICROS), -1_000);
    }
}
