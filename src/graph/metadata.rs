//! Stream and container metadata descriptors.
//!
//! Metadata records are immutable by convention: a filter operation never
//! mutates a record it was given, it derives a new one (`with_range`,
//! `with_duration`, ...). Times are seconds.

use serde::{Deserialize, Serialize};

use crate::foundation::rational::Rational;

/// Media class of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// Picture stream.
    Video,
    /// Sound stream.
    Audio,
}

/// Container-level metadata reported by the demuxer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormatMetadata {
    /// Container format name, e.g. `mp4` or `matroska`.
    pub format_name: String,
    /// Total duration in seconds, zero when unknown.
    pub duration: f64,
    /// Container bit rate in bits per second, zero when unknown.
    pub bit_rate: i64,
}

/// Fields shared by every stream regardless of media type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamCommon {
    /// Stream index inside its container.
    pub index: usize,
    /// Time base all timestamps of this stream are expressed in.
    pub time_base: Rational,
    /// Presentation start time in seconds.
    pub start_time: f64,
    /// Duration in seconds.
    pub duration: f64,
    /// Stream bit rate in bits per second, zero when unknown.
    pub bit_rate: i64,
    /// Codec name as the engine reports it.
    pub codec_name: String,
    /// Codec extra data (e.g. decoder configuration records).
    #[serde(default)]
    pub extra_data: Vec<u8>,
}

/// Video-only stream parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    /// Shared fields.
    pub common: StreamCommon,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format name, e.g. `yuv420p`.
    pub pixel_format: String,
    /// Nominal frame rate.
    pub frame_rate: Rational,
    /// Sample aspect ratio.
    pub sample_aspect_ratio: Rational,
}

/// Audio-only stream parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioStream {
    /// Shared fields.
    pub common: StreamCommon,
    /// Linear volume factor, `1.0` = unchanged.
    pub volume: f64,
    /// Sample format name, e.g. `fltp`.
    pub sample_format: String,
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u32,
    /// Channel layout name, e.g. `stereo`.
    pub channel_layout: String,
}

/// Per-stream metadata, tagged by media type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "media_type", rename_all = "snake_case")]
pub enum StreamMetadata {
    /// A video stream.
    Video(VideoStream),
    /// An audio stream.
    Audio(AudioStream),
}

impl StreamMetadata {
    /// Media class of this stream.
    pub fn media_type(&self) -> MediaType {
        match self {
            Self::Video(_) => MediaType::Video,
            Self::Audio(_) => MediaType::Audio,
        }
    }

    /// Shared fields.
    pub fn common(&self) -> &StreamCommon {
        match self {
            Self::Video(v) => &v.common,
            Self::Audio(a) => &a.common,
        }
    }

    fn common_mut(&mut self) -> &mut StreamCommon {
        match self {
            Self::Video(v) => &mut v.common,
            Self::Audio(a) => &mut a.common,
        }
    }

    /// Presentation start time in seconds.
    pub fn start_time(&self) -> f64 {
        self.common().start_time
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.common().duration
    }

    /// The audio parameters, when this is an audio stream.
    pub fn as_audio(&self) -> Option<&AudioStream> {
        match self {
            Self::Audio(a) => Some(a),
            Self::Video(_) => None,
        }
    }

    /// The video parameters, when this is a video stream.
    pub fn as_video(&self) -> Option<&VideoStream> {
        match self {
            Self::Video(v) => Some(v),
            Self::Audio(_) => None,
        }
    }

    /// Derive a copy with a new `[start, start + duration]` range.
    pub fn with_range(&self, start: f64, duration: f64) -> Self {
        let mut out = self.clone();
        let common = out.common_mut();
        common.start_time = start;
        common.duration = duration;
        out
    }

    /// Derive a copy with a new duration.
    pub fn with_duration(&self, duration: f64) -> Self {
        let mut out = self.clone();
        out.common_mut().duration = duration;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio() -> StreamMetadata {
        StreamMetadata::Audio(AudioStream {
            common: StreamCommon {
                index: 0,
                time_base: Rational::new(1, 48000),
                start_time: 0.0,
                duration: 5.0,
                bit_rate: 128_000,
                codec_name: "aac".into(),
                extra_data: vec![],
            },
            volume: 1.0,
            sample_format: "fltp".into(),
            sample_rate: 48000,
            channels: 2,
            channel_layout: "stereo".into(),
        })
    }

    #[test]
    fn with_range_derives_without_mutating() {
        let base = audio();
        let trimmed = base.with_range(1.0, 2.0);
        assert_eq!(base.start_time(), 0.0);
        assert_eq!(base.duration(), 5.0);
        assert_eq!(trimmed.start_time(), 1.0);
        assert_eq!(trimmed.duration(), 2.0);
    }

    #[test]
    fn with_duration_keeps_everything_else() {
        let base = audio();
        let looped = base.with_duration(15.0);
        assert_eq!(looped.duration(), 15.0);
        assert_eq!(looped.as_audio().unwrap().sample_rate, 48000);
        assert_eq!(looped.start_time(), base.start_time());
    }
}
